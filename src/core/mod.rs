//! 核心层：错误与恢复、运行状态机、运行登记表、优雅关闭

pub mod error;
pub mod recovery;
pub mod run_registry;
pub mod shutdown;
pub mod state;

pub use error::{AgentError, ErrorInfo, ErrorKind, RecoveryAction};
pub use recovery::{RecoveryEngine, RecoveryHook};
pub use run_registry::{RunId, RunRegistry, RunSummary};
pub use shutdown::{
    ExperienceStoreCleanup, RunRegistryCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use state::{RunState, RunStatus};
