//! 动作协作方：把单个步骤落到操作系统输入上
//!
//! 每次 perform 恰好产生一次副作用，内部不重试（重试与补救由控制器决定）。
//! 成功返回细节映射，失败返回错误描述（例如 "application not found"）。

pub mod simulated;

use async_trait::async_trait;

use crate::perception::EnvironmentSnapshot;
use crate::plan::{ActionKind, Parameters};

pub use simulated::SimulatedAction;

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn perform(
        &self,
        kind: ActionKind,
        parameters: &Parameters,
        snapshot: &EnvironmentSnapshot,
    ) -> Result<Parameters, String>;
}
