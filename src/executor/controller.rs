//! 执行控制器：按顺序驱动 Plan，对每一步施加超时、失败即停
//!
//! 每一步：检查取消 → 向 Perception 取快照 → find_element 由控制器直接向 Perception 查找，
//! 其余交给 Action 派发 → 记录 StepResult。步骤失败时调用恢复钩子；替代动作受次数上限约束，
//! 且补救后的结果仍只占该步骤一个 StepResult。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::action::ActionDispatcher;
use crate::config::ExecutorSection;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, RecoveryHook, RunState, RunStatus};
use crate::executor::RunReport;
use crate::perception::Perception;
use crate::plan::{ActionKind, ActionStep, Instruction, Parameters, Plan, StepResult};

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub step_timeout: Duration,
    pub perception_timeout: Duration,
    /// 每个步骤最多执行几次替代动作；0 表示只记录并停止
    pub max_recovery_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::from(&ExecutorSection::default())
    }
}

impl From<&ExecutorSection> for ExecutionConfig {
    fn from(section: &ExecutorSection) -> Self {
        Self {
            step_timeout: section.step_timeout(),
            perception_timeout: section.perception_timeout(),
            max_recovery_attempts: section.max_recovery_attempts,
        }
    }
}

pub struct ExecutionController {
    perception: Arc<dyn Perception>,
    action: Arc<dyn ActionDispatcher>,
    recovery: Arc<dyn RecoveryHook>,
    config: ExecutionConfig,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn params_preview(params: &Parameters) -> String {
    let s = Value::Object(params.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

impl ExecutionController {
    pub fn new(
        perception: Arc<dyn Perception>,
        action: Arc<dyn ActionDispatcher>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            perception,
            action,
            recovery: Arc::new(RecoveryEngine::new()),
            config,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryHook>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn perception(&self) -> &Arc<dyn Perception> {
        &self.perception
    }

    /// 执行计划；空计划返回 Validation 错误，其余情况都返回终态 RunReport
    pub async fn execute_plan(
        &self,
        instruction: &Instruction,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AgentError> {
        if plan.is_empty() {
            return Err(AgentError::Validation(
                "plan has no steps; nothing to execute".to_string(),
            ));
        }

        let started_at = now_ms();
        let mut state = RunState::new();
        state.advance(RunStatus::Running)?;
        tracing::info!(steps = plan.len(), instruction = %instruction.text, "run started");

        let mut results: Vec<StepResult> = Vec::with_capacity(plan.len());
        let mut halt: Option<AgentError> = None;

        for (index, step) in plan.iter().enumerate() {
            // 只在步骤之间响应取消，进行中的输入动作不中断
            if cancel.is_cancelled() {
                tracing::info!(step = index + 1, "cancellation requested, halting run");
                halt = Some(AgentError::Cancelled(format!(
                    "cancelled before step {} of {}",
                    index + 1,
                    plan.len()
                )));
                break;
            }

            let (result, error) = self.run_step(index, step, cancel).await;
            results.push(result);
            if let Some(error) = error {
                halt = Some(error);
                break;
            }
        }

        let report = RunReport::finished(instruction.clone(), plan.clone(), results, started_at, halt);
        state.advance(report.status)?;
        tracing::info!(
            status = %report.status,
            executed = report.step_results.len(),
            planned = plan.len(),
            duration_ms = report.duration_ms(),
            "run finished"
        );
        Ok(report)
    }

    /// 执行单个步骤（含补救）；返回该步骤的唯一 StepResult 及导致停止的错误
    async fn run_step(
        &self,
        index: usize,
        step: &ActionStep,
        cancel: &CancellationToken,
    ) -> (StepResult, Option<AgentError>) {
        let mut attempt: u32 = 1;
        let mut current = step.clone();
        let mut first_error: Option<AgentError> = None;

        loop {
            match self.attempt(index, &current).await {
                Ok(mut detail) => {
                    if let Some(original) = &first_error {
                        detail.insert("remediated_with".into(), json!(current.description));
                        detail.insert("original_error".into(), json!(original.to_string()));
                    }
                    let result = StepResult::succeeded(index, step.clone(), detail).with_attempts(attempt);
                    return (result, None);
                }
                Err(error) => {
                    let action =
                        self.recovery
                            .on_step_failure(&current, &current.parameters, &error, attempt);
                    let may_retry =
                        attempt <= self.config.max_recovery_attempts && !cancel.is_cancelled();
                    if let (RecoveryAction::Substitute(alternate), true) = (action, may_retry) {
                        tracing::warn!(
                            step = index + 1,
                            alternate = %alternate.description,
                            "substituting alternate action"
                        );
                        first_error.get_or_insert_with(|| error.clone());
                        attempt += 1;
                        current = alternate;
                        continue;
                    }

                    let mut result = StepResult::failed(index, step.clone(), &error).with_attempts(attempt);
                    if current != *step {
                        result
                            .detail
                            .insert("remediated_with".into(), json!(current.description));
                    }
                    return (result, Some(error));
                }
            }
        }
    }

    /// 单次尝试：快照 → 查找或派发；两段各自限时
    async fn attempt(&self, index: usize, step: &ActionStep) -> Result<Parameters, AgentError> {
        let started = Instant::now();
        let outcome = self.attempt_inner(step).await;

        let (ok, label) = match &outcome {
            Ok(_) => (true, "ok"),
            Err(e) if e.kind().is_timeout() => (false, "timeout"),
            Err(_) => (false, "error"),
        };
        let audit = json!({
            "event": "step_audit",
            "step": index + 1,
            "kind": step.kind.as_str(),
            "ok": ok,
            "outcome": label,
            "duration_ms": started.elapsed().as_millis() as u64,
            "params_preview": params_preview(&step.parameters),
        });
        tracing::info!(audit = %audit.to_string(), "step");
        outcome
    }

    async fn attempt_inner(&self, step: &ActionStep) -> Result<Parameters, AgentError> {
        let snapshot = match timeout(self.config.perception_timeout, self.perception.get_current_state()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Err(AgentError::PerceptionFailed(e)),
            Err(_) => {
                return Err(AgentError::PerceptionTimeout(format!(
                    "snapshot not ready within {} ms",
                    self.config.perception_timeout.as_millis()
                )))
            }
        };
        tracing::debug!(kind = %step.kind, snapshot = %snapshot.description, "dispatching step");

        if step.kind == ActionKind::FindElement {
            return match timeout(self.config.step_timeout, self.perception.find_element(&step.parameters)).await {
                Ok(Ok(Some(element))) => {
                    let detail = json!({
                        "found_element": element,
                        "message": "Element found",
                        "snapshot_at": snapshot.timestamp,
                    });
                    Ok(detail.as_object().cloned().unwrap_or_default())
                }
                Ok(Ok(None)) => Err(AgentError::ElementNotFound(params_preview(&step.parameters))),
                Ok(Err(e)) => Err(AgentError::PerceptionFailed(e)),
                Err(_) => Err(AgentError::StepTimeout(format!(
                    "find_element exceeded {} ms",
                    self.config.step_timeout.as_millis()
                ))),
            };
        }

        match timeout(
            self.config.step_timeout,
            self.action.perform(step.kind, &step.parameters, &snapshot),
        )
        .await
        {
            Ok(Ok(mut detail)) => {
                detail
                    .entry("snapshot_at")
                    .or_insert_with(|| json!(snapshot.timestamp));
                Ok(detail)
            }
            Ok(Err(e)) => Err(AgentError::ActionDispatch(e)),
            Err(_) => Err(AgentError::StepTimeout(format!(
                "{} exceeded {} ms",
                step.kind,
                self.config.step_timeout.as_millis()
            ))),
        }
    }
}
