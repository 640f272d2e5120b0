//! 运行状态机：Pending → Running → {Succeeded, PartiallyCompleted, Failed}
//!
//! 终态不可再迁移；恢复只能通过重新规划发起新的执行尝试。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::plan::StepResult;

/// 单次执行尝试的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    PartiallyCompleted,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::PartiallyCompleted | RunStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyCompleted => "partially_completed",
            RunStatus::Failed => "failed",
        }
    }

    /// 由计划长度与已执行结果推导终态：
    /// 全部执行且全部成功 → Succeeded；至少一步成功 → PartiallyCompleted；否则 Failed
    pub fn from_results(plan_len: usize, results: &[StepResult]) -> RunStatus {
        let successes = results.iter().filter(|r| r.success).count();
        if plan_len > 0 && results.len() == plan_len && successes == plan_len {
            RunStatus::Succeeded
        } else if successes > 0 {
            RunStatus::PartiallyCompleted
        } else {
            RunStatus::Failed
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 带迁移校验的状态持有者
#[derive(Debug, Clone)]
pub struct RunState {
    status: RunStatus,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Pending,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// 迁移到下一个状态；非法迁移返回 Validation 错误且状态不变
    pub fn advance(&mut self, next: RunStatus) -> Result<(), AgentError> {
        let allowed = match (self.status, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            // 规划失败：未进入 Running 直接失败
            (RunStatus::Pending, RunStatus::Failed) => true,
            (RunStatus::Running, s) => s.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(AgentError::Validation(format!(
                "illegal run transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}
