//! 错误恢复钩子
//!
//! 执行控制器在任何步骤失败时调用 RecoveryHook::on_step_failure(step, parameters, error, attempt)。
//! 默认策略是「记录并停止」；RecoveryEngine 可按动作类型登记一个替代步骤，由控制器按次数上限执行。

use std::collections::HashMap;

use crate::core::{AgentError, ErrorKind, RecoveryAction};
use crate::plan::{ActionKind, ActionStep, Parameters};

/// 步骤失败回调；attempt 从 1 开始，表示该步骤已失败的尝试次数
pub trait RecoveryHook: Send + Sync {
    fn on_step_failure(
        &self,
        step: &ActionStep,
        parameters: &Parameters,
        error: &AgentError,
        attempt: u32,
    ) -> RecoveryAction;
}

/// 按动作类型登记替代步骤；未登记时记录并停止
#[derive(Debug, Default)]
pub struct RecoveryEngine {
    fallbacks: HashMap<ActionKind, ActionStep>,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某类动作登记替代步骤（例如 open_app 失败时改用快捷键唤起启动器）
    pub fn with_fallback(mut self, kind: ActionKind, alternate: ActionStep) -> Self {
        self.fallbacks.insert(kind, alternate);
        self
    }

    fn recoverable(kind: ErrorKind) -> bool {
        // 取消与存储类错误不做补救
        matches!(
            kind,
            ErrorKind::ActionDispatch
                | ErrorKind::ElementNotFound
                | ErrorKind::StepTimeout
                | ErrorKind::PerceptionTimeout
        )
    }
}

impl RecoveryHook for RecoveryEngine {
    fn on_step_failure(
        &self,
        step: &ActionStep,
        parameters: &Parameters,
        error: &AgentError,
        attempt: u32,
    ) -> RecoveryAction {
        tracing::warn!(
            kind = %step.kind,
            attempt,
            error = %error,
            params = %serde_json::Value::Object(parameters.clone()),
            "step failed: {}",
            step.description
        );
        if !Self::recoverable(error.kind()) {
            return RecoveryAction::Halt;
        }
        match self.fallbacks.get(&step.kind) {
            // 替代步骤本身失败时不再链式替换
            Some(alternate) if alternate != step => RecoveryAction::Substitute(alternate.clone()),
            _ => RecoveryAction::Halt,
        }
    }
}
