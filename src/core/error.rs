//! Agent 错误类型与恢复动作
//!
//! AgentError 覆盖规划、感知、动作派发、取消、存储等失败；ErrorKind 是写入 RunReport / StepResult 的机器可读类别。
//! RecoveryAction 由 RecoveryHook 返回，决定步骤失败后是停止还是尝试一次替代动作。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::ActionStep;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 指令或计划不合法（空指令、空计划、未知动作类型、缺少参数）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 规划 oracle 不可用或输出无法使用
    #[error("Planning failure: {0}")]
    PlanningFailure(String),

    #[error("Perception timeout: {0}")]
    PerceptionTimeout(String),

    #[error("Perception failed: {0}")]
    PerceptionFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Action 协作方报告的失败（含系统级错误，如 application not found）
    #[error("Action dispatch error: {0}")]
    ActionDispatch(String),

    #[error("Step timeout: {0}")]
    StepTimeout(String),

    #[error("Cancellation requested: {0}")]
    Cancelled(String),

    /// 经验库读写失败
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Validation(_) => ErrorKind::Validation,
            AgentError::PlanningFailure(_) => ErrorKind::PlanningFailure,
            AgentError::PerceptionTimeout(_) => ErrorKind::PerceptionTimeout,
            AgentError::PerceptionFailed(_) => ErrorKind::PerceptionFailure,
            AgentError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            AgentError::ActionDispatch(_) => ErrorKind::ActionDispatch,
            AgentError::StepTimeout(_) => ErrorKind::StepTimeout,
            AgentError::Cancelled(_) => ErrorKind::CancellationRequested,
            AgentError::StorageFailure(_) => ErrorKind::StorageFailure,
            AgentError::ConfigError(_) => ErrorKind::Config,
        }
    }

    /// 转为可序列化的错误描述（写入报告）
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::StorageFailure(e.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}

/// 机器可读的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    PlanningFailure,
    PerceptionTimeout,
    PerceptionFailure,
    ElementNotFound,
    ActionDispatch,
    StepTimeout,
    CancellationRequested,
    StorageFailure,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::PlanningFailure => "planning_failure",
            ErrorKind::PerceptionTimeout => "perception_timeout",
            ErrorKind::PerceptionFailure => "perception_failure",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::ActionDispatch => "action_dispatch",
            ErrorKind::StepTimeout => "step_timeout",
            ErrorKind::CancellationRequested => "cancellation_requested",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Config => "config",
        }
    }

    /// 是否属于超时类（感知或单步）
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::PerceptionTimeout | ErrorKind::StepTimeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 报告中的错误：类别 + 人类可读消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// 恢复钩子根据失败步骤给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 记录并停止（默认策略）
    Halt,
    /// 用替代步骤补救一次；受控制器的尝试次数上限约束
    Substitute(ActionStep),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            AgentError::Cancelled("x".into()).kind(),
            ErrorKind::CancellationRequested
        );
        assert_eq!(
            AgentError::ActionDispatch("application not found".into()).kind(),
            ErrorKind::ActionDispatch
        );
        assert!(AgentError::StepTimeout("click".into()).kind().is_timeout());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CancellationRequested).unwrap();
        assert_eq!(json, "\"cancellation_requested\"");
        let info = AgentError::StorageFailure("disk full".into()).to_info();
        assert_eq!(info.kind, ErrorKind::StorageFailure);
        assert!(info.message.contains("disk full"));
    }
}
