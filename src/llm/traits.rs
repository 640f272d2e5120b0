//! LLM 客户端抽象
//!
//! 规划 oracle 只需要非流式 complete；后端（OpenAI 兼容 / Mock）实现 LlmClient。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；失败时返回错误字符串
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
