//! Deskpilot - 桌面任务自动化智能体
//!
//! 自然语言指令 → 计划 → 逐步执行 → 经验回流。
//!
//! 模块划分：
//! - **agent**: Agent 运行时（submit / start / get_status / cancel）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行状态机、恢复钩子、运行登记、优雅关闭
//! - **plan**: 指令、动作步骤、计划、单步结果与已知动作类型注册表
//! - **memory**: 经验库（相似度检索、保留策略、SQLite 持久化）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）及嵌入
//! - **perception** / **action**: 感知与动作协作方接口及模拟桌面实现
//! - **planner**: 规划 oracle（规则 / LLM）与 Planner
//! - **executor**: 执行控制器与 RunReport
//! - **feedback**: 反馈记录与强化信号
//! - **observability**: tracing 初始化

pub mod action;
pub mod agent;
pub mod config;
pub mod core;
pub mod executor;
pub mod feedback;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod perception;
pub mod plan;
pub mod planner;

pub use agent::{Agent, AgentStatus};
pub use executor::RunReport;
