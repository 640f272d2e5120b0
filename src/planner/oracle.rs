//! 规划 oracle 接口
//!
//! oracle 把自然语言指令翻译为候选步骤序列。Ok(vec![]) 表示「没有建议」，与故障（Err）严格区分：
//! 前者由 Planner 走经验复用或兜底步骤，后者作为 PlanningFailure 上报。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::ExperienceRecord;
use crate::perception::EnvironmentSnapshot;
use crate::plan::{ActionKind, CandidateStep, Instruction};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    /// 后端不可达、超时、鉴权失败等
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// 有回复但无法解析为步骤序列
    #[error("malformed oracle output: {0}")]
    MalformedOutput(String),
}

/// oracle 可参考的上下文；检索到的经验只作参考
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub experiences: &'a [Arc<ExperienceRecord>],
    pub snapshot: Option<&'a EnvironmentSnapshot>,
    pub enabled_kinds: &'a [ActionKind],
}

#[async_trait]
pub trait PlanningOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        instruction: &Instruction,
        context: &PlanningContext<'_>,
    ) -> Result<Vec<CandidateStep>, OracleError>;
}
