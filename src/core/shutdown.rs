//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 或显式调用后：
//! - 取消所有尚未结束的运行（各自的 CancellationToken）
//! - 关闭经验库后端（SQLite 连接落盘）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::RunRegistry;
use crate::memory::ExperienceStore;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 宿主程序主动结束（例如 CLI 单次运行完成）
    Completed,
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token；运行级取消 token 应从它派生（child_token）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(reason = ?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling in-flight runs...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling in-flight runs...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行全部清理；单个任务失败或超时只记录警告
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());
        let mut completed = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!("Cleanup task '{}' completed", name);
                }
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {:?}",
                    name,
                    self.timeout
                ),
            }
        }
        completed
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 取消所有未结束的运行
pub struct RunRegistryCleanup {
    registry: Arc<RunRegistry>,
}

impl RunRegistryCleanup {
    pub fn new(registry: Arc<RunRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RunRegistryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let cancelled = self
            .registry
            .list()
            .into_iter()
            .filter(|run| self.registry.cancel(run.run_id))
            .count();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled in-flight runs");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RunRegistry"
    }
}

/// 关闭经验库后端
pub struct ExperienceStoreCleanup {
    store: Arc<ExperienceStore>,
}

impl ExperienceStoreCleanup {
    pub fn new(store: Arc<ExperienceStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ExperienceStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ExperienceStore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let child = manager.token().child_token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::Completed);
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct FailingCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for FailingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            anyhow::bail!("disk gone")
        }

        fn name(&self) -> &'static str {
            "Failing"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_all_tasks() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(FailingCleanup);
        coordinator.register(FlagCleanup {
            called: called.clone(),
        });
        assert_eq!(coordinator.run_cleanup().await, 1);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_registry_cleanup_cancels_active() {
        let registry = Arc::new(RunRegistry::new());
        let token = CancellationToken::new();
        registry.register("wait", token.clone());
        RunRegistryCleanup::new(registry).cleanup().await.unwrap();
        assert!(token.is_cancelled());
    }
}
