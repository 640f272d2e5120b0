//! Agent 运行时
//!
//! 把经验库、规划器、执行控制器与反馈记录器接成一条流水线：
//! 指令 → 检索经验 → 规划 → 执行 → 学习。对外暴露 submit / start / get_status / cancel。
//! 每次 submit 都返回带终态的 RunReport；存储失败只作为警告附加，不改变 status。

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionDispatcher, SimulatedAction};
use crate::config::AppConfig;
use crate::core::{
    AgentError, ExperienceStoreCleanup, RecoveryHook, RunId, RunRegistry, RunRegistryCleanup,
    RunStatus, RunSummary, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use crate::executor::{ExecutionConfig, ExecutionController, RunReport};
use crate::feedback::{FeedbackRecorder, RewardLedger};
use crate::llm::{create_embedder_from_config, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{
    ExperienceBackend, ExperienceStore, InMemoryBackend, PruneReport, RetentionPolicy,
    SqliteBackend,
};
use crate::perception::{EnvironmentSnapshot, Perception, SimulatedDesktop, SimulatedPerception};
use crate::plan::{Instruction, KindRegistry, Plan};
use crate::planner::{LlmOracle, Planner, PlanningOracle, RuleOracle};

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// status() 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub platform: String,
    pub oracle: String,
    pub backend: String,
    pub experiences: usize,
    pub errors: usize,
    pub active_runs: usize,
    /// 经验库中成功执行的比例
    pub success_rate: f32,
    pub total_reward: f64,
    pub healthy: bool,
}

pub struct Agent {
    config: AppConfig,
    store: Arc<ExperienceStore>,
    planner: Planner,
    controller: ExecutionController,
    recorder: FeedbackRecorder,
    ledger: Arc<RewardLedger>,
    runs: Arc<RunRegistry>,
}

/// 按 [llm].provider 选择规划 oracle：openai（需 OPENAI_API_KEY）/ mock / rules
pub(crate) fn create_oracle_from_config(cfg: &AppConfig) -> Arc<dyn PlanningOracle> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "openai" => match std::env::var("OPENAI_API_KEY").ok() {
            Some(key) => {
                tracing::info!("Using OpenAI planning oracle ({})", cfg.llm.model);
                let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    Some(&key),
                ));
                Arc::new(LlmOracle::new(llm))
            }
            None => {
                tracing::warn!("OPENAI_API_KEY not set, using rule-based planning oracle");
                Arc::new(RuleOracle::new())
            }
        },
        "mock" => Arc::new(LlmOracle::new(Arc::new(MockLlmClient::default()))),
        _ => Arc::new(RuleOracle::new()),
    }
}

impl Agent {
    pub fn new(
        config: AppConfig,
        store: Arc<ExperienceStore>,
        oracle: Arc<dyn PlanningOracle>,
        perception: Arc<dyn Perception>,
        action: Arc<dyn ActionDispatcher>,
    ) -> Result<Self, AgentError> {
        let registry = KindRegistry::new().with_disabled(&config.planner.disabled_kinds)?;
        let planner = Planner::new(oracle, registry).with_replay(config.planner.replay_experience);
        let controller = ExecutionController::new(
            perception,
            action,
            ExecutionConfig::from(&config.executor),
        );
        let ledger = Arc::new(RewardLedger::new());
        let recorder = FeedbackRecorder::new(Arc::clone(&store)).with_policy(ledger.clone());
        Ok(Self {
            config,
            store,
            planner,
            controller,
            recorder,
            ledger,
            runs: Arc::new(RunRegistry::new()),
        })
    }

    /// 从配置构建：SQLite 或内存经验库、嵌入、oracle，以及共享同一模拟桌面的感知与动作
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let backend: Arc<dyn ExperienceBackend> = match &cfg.memory.path {
            Some(path) => Arc::new(SqliteBackend::open(path)?),
            None => Arc::new(InMemoryBackend),
        };
        let embedder = create_embedder_from_config(
            &cfg.llm.provider,
            cfg.llm.base_url.as_deref(),
            cfg.llm
                .embedding_model
                .as_deref()
                .unwrap_or(DEFAULT_EMBEDDING_MODEL),
            cfg.memory.embedding_dim,
        );
        let store = Arc::new(ExperienceStore::open(backend, embedder)?);

        let desktop = SimulatedDesktop::new();
        let perception = Arc::new(SimulatedPerception::new(Arc::clone(&desktop)));
        let action = Arc::new(SimulatedAction::new(desktop, &cfg.action));

        Self::new(
            cfg.clone(),
            store,
            create_oracle_from_config(cfg),
            perception,
            action,
        )
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryHook>) -> Self {
        self.controller = self.controller.with_recovery(recovery);
        self
    }

    pub fn store(&self) -> &Arc<ExperienceStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<RewardLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 同步执行一条指令直到终态
    pub async fn submit(&self, instruction: impl Into<Instruction>) -> RunReport {
        self.submit_with_cancel(instruction, CancellationToken::new())
            .await
    }

    /// 同 submit，但由调用方持有取消令牌
    pub async fn submit_with_cancel(
        &self,
        instruction: impl Into<Instruction>,
        cancel: CancellationToken,
    ) -> RunReport {
        let instruction = instruction.into();
        let run_id = self.runs.register(&instruction.text, cancel.clone());
        self.run(run_id, instruction, cancel).await
    }

    /// 后台执行；返回运行 id 与结果句柄，可用 get_status / cancel 跟踪
    pub fn start(self: &Arc<Self>, instruction: impl Into<Instruction>) -> (RunId, JoinHandle<RunReport>) {
        let instruction = instruction.into();
        let cancel = CancellationToken::new();
        let run_id = self.runs.register(&instruction.text, cancel.clone());
        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move { agent.run(run_id, instruction, cancel).await });
        (run_id, handle)
    }

    pub fn get_status(&self, run_id: RunId) -> Option<RunStatus> {
        self.runs.get_status(run_id)
    }

    /// 请求取消；在下一个步骤开始前生效。运行不存在或已结束时返回 false
    pub fn cancel(&self, run_id: RunId) -> bool {
        self.runs.cancel(run_id)
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        self.runs.list()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            name: self
                .config
                .app
                .name
                .clone()
                .unwrap_or_else(|| "deskpilot".to_string()),
            platform: std::env::consts::OS.to_string(),
            oracle: self.planner.oracle_name().to_string(),
            backend: self.store.backend_name().to_string(),
            experiences: self.store.size(),
            errors: self.store.error_count(),
            active_runs: self.runs.active_count(),
            success_rate: self
                .store
                .summarize_all()
                .map(|s| s.success_rate())
                .unwrap_or(0.0),
            total_reward: self.ledger.total_reward(),
            healthy: !self.store.is_closed(),
        }
    }

    /// 按配置的保留策略清理经验库
    pub fn prune(&self) -> Result<PruneReport, AgentError> {
        self.store
            .prune(&RetentionPolicy::from_config(&self.config.memory.retention))
    }

    /// 注册本 Agent 的清理任务：先取消未结束的运行，再关闭经验库
    pub fn shutdown_coordinator(&self, manager: Arc<ShutdownManager>) -> ShutdownCoordinator {
        let mut coordinator = ShutdownCoordinator::new(manager);
        coordinator.register(RunRegistryCleanup::new(Arc::clone(&self.runs)));
        coordinator.register(ExperienceStoreCleanup::new(Arc::clone(&self.store)));
        coordinator
    }

    /// 立即关闭；返回成功完成的清理任务数
    pub async fn shutdown(&self) -> usize {
        let manager = Arc::new(ShutdownManager::new());
        manager.shutdown(ShutdownReason::Completed);
        self.shutdown_coordinator(manager).run_cleanup().await
    }

    async fn run(&self, run_id: RunId, instruction: Instruction, cancel: CancellationToken) -> RunReport {
        self.runs.set_status(run_id, RunStatus::Running);
        let report = self.run_pipeline(&instruction, &cancel).await.with_run_id(run_id);
        self.runs.set_status(run_id, report.status);
        tracing::info!(run = %run_id, status = %report.status, "run completed");
        let ttl_ms = i64::try_from(self.config.app.finished_run_ttl().as_millis()).unwrap_or(i64::MAX);
        self.runs.cleanup_finished(ttl_ms);
        report
    }

    async fn observe(&self) -> Option<EnvironmentSnapshot> {
        let perception = self.controller.perception();
        match timeout(
            self.controller.config().perception_timeout,
            perception.get_current_state(),
        )
        .await
        {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "planning without environment snapshot");
                None
            }
            Err(_) => {
                tracing::warn!("environment snapshot timed out, planning without it");
                None
            }
        }
    }

    async fn run_pipeline(&self, instruction: &Instruction, cancel: &CancellationToken) -> RunReport {
        let started_at = chrono::Utc::now().timestamp_millis();
        let mut warnings = Vec::new();

        let snapshot = if self.config.app.plan_with_snapshot {
            self.observe().await
        } else {
            None
        };

        let experiences = self
            .store
            .retrieve_relevant(&instruction.text, self.config.app.retrieve_top_k)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "experience retrieval failed, planning without history");
                warnings.push(format!("experience retrieval failed: {e}"));
                Vec::new()
            });

        let plan = match self
            .planner
            .create_plan(instruction, &experiences, snapshot.as_ref())
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "planning failed");
                let mut report = RunReport::planning_failed(instruction.clone(), &e, started_at);
                self.log_error(instruction, None, &e, &mut report);
                warnings.into_iter().for_each(|w| report.attach_warning(w));
                return report;
            }
        };

        let mut report = match self.controller.execute_plan(instruction, &plan, cancel).await {
            Ok(report) => report,
            Err(e) => {
                let mut report =
                    RunReport::finished(instruction.clone(), plan.clone(), Vec::new(), started_at, Some(e.clone()));
                self.log_error(instruction, Some(&plan), &e, &mut report);
                report
            }
        };
        warnings.into_iter().for_each(|w| report.attach_warning(w));

        if let Err(e) = self.recorder.learn(instruction, &plan, &report) {
            report.attach_warning(format!("experience not recorded: {e}"));
        }
        report
    }

    fn log_error(
        &self,
        instruction: &Instruction,
        plan: Option<&Plan>,
        error: &AgentError,
        report: &mut RunReport,
    ) {
        if let Err(e) = self.store.record_error(instruction, plan, error.to_info()) {
            tracing::warn!(error = %e, "failed to record error");
            report.attach_warning(format!("error not recorded: {e}"));
        }
    }
}
