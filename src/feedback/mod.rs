//! 反馈层：把 RunReport 写回经验库，并向可选的策略更新方发送强化信号
//!
//! learn 总会调用 record_experience；信号在存储结果确定后发送，存储失败也照常发送，
//! 且绝不改变已确定的任务 status。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::core::{AgentError, RunStatus};
use crate::executor::RunReport;
use crate::memory::{ExperienceRecord, ExperienceStore};
use crate::plan::{ActionKind, Instruction, Plan};

/// 带符号的强化信号：成功为正，失败为负，部分完成为中性并附带进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "polarity")]
pub enum Reinforcement {
    Positive,
    Negative,
    /// progress = 成功步数 / 计划步数
    Partial { progress: f32 },
}

impl Reinforcement {
    pub fn from_report(report: &RunReport) -> Self {
        match report.status {
            RunStatus::Succeeded => Reinforcement::Positive,
            RunStatus::PartiallyCompleted => {
                let planned = report.plan.len().max(1) as f32;
                Reinforcement::Partial {
                    progress: report.succeeded_steps() as f32 / planned,
                }
            }
            _ => Reinforcement::Negative,
        }
    }

    pub fn reward(&self) -> f32 {
        match self {
            Reinforcement::Positive => 1.0,
            Reinforcement::Negative => -1.0,
            Reinforcement::Partial { .. } => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReinforcementSignal {
    pub reinforcement: Reinforcement,
    pub status: RunStatus,
    /// 已执行步骤的 (类型, 是否成功)，按执行顺序
    pub step_outcomes: Vec<(ActionKind, bool)>,
    /// 经验写入成功时的记录 id
    pub experience_id: Option<u64>,
}

impl ReinforcementSignal {
    pub fn from_report(report: &RunReport, experience_id: Option<u64>) -> Self {
        Self {
            reinforcement: Reinforcement::from_report(report),
            status: report.status,
            step_outcomes: report
                .step_results
                .iter()
                .map(|r| (r.step.kind, r.success))
                .collect(),
            experience_id,
        }
    }
}

/// 策略更新方：接收每次执行的强化信号
pub trait PolicyUpdater: Send + Sync {
    fn name(&self) -> &str;

    fn update(&self, instruction: &Instruction, signal: &ReinforcementSignal);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub successes: u64,
    pub failures: u64,
}

impl KindStats {
    pub fn success_rate(&self) -> f32 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f32 / total as f32
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    per_kind: BTreeMap<ActionKind, KindStats>,
    total_reward: f64,
    signals: u64,
}

/// 默认策略更新方：按动作类型累计成功/失败次数与总奖励
#[derive(Debug, Default)]
pub struct RewardLedger {
    state: Mutex<LedgerState>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, kind: ActionKind) -> KindStats {
        self.state
            .lock()
            .map(|s| s.per_kind.get(&kind).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn total_reward(&self) -> f64 {
        self.state.lock().map(|s| s.total_reward).unwrap_or(0.0)
    }

    pub fn signal_count(&self) -> u64 {
        self.state.lock().map(|s| s.signals).unwrap_or(0)
    }
}

impl PolicyUpdater for RewardLedger {
    fn name(&self) -> &str {
        "reward_ledger"
    }

    fn update(&self, instruction: &Instruction, signal: &ReinforcementSignal) {
        let Ok(mut state) = self.state.lock() else {
            tracing::warn!("reward ledger lock poisoned, signal dropped");
            return;
        };
        for (kind, ok) in &signal.step_outcomes {
            let stats = state.per_kind.entry(*kind).or_default();
            if *ok {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }
        state.total_reward += f64::from(signal.reinforcement.reward());
        state.signals += 1;
        tracing::debug!(
            instruction = %instruction.text,
            reward = signal.reinforcement.reward(),
            total = state.total_reward,
            "policy updated"
        );
    }
}

/// 由报告生成一句反思文本
pub fn reflect(report: &RunReport) -> String {
    let kinds: Vec<&str> = report.plan.iter().map(|s| s.kind.as_str()).collect();
    let executed = report.step_results.len();
    let planned = report.plan.len();

    if report.plan.is_fallback() {
        return "No specific strategy was known for this instruction; a generic step was attempted."
            .to_string();
    }
    match report.status {
        RunStatus::Succeeded => format!(
            "Completed all {planned} steps ({}).",
            kinds.join(" -> ")
        ),
        _ => {
            let mut text = match report.step_results.iter().find(|r| !r.success) {
                Some(failed) => format!(
                    "Halted at step {} of {planned} ({})",
                    failed.index + 1,
                    failed.step.kind
                ),
                None => format!("Stopped after {executed} of {planned} steps"),
            };
            if let Some(error) = &report.error {
                text.push_str(&format!(": {} ({})", error.message, error.kind));
            }
            text.push('.');
            text
        }
    }
}

pub struct FeedbackRecorder {
    store: Arc<ExperienceStore>,
    policy: Option<Arc<dyn PolicyUpdater>>,
}

impl FeedbackRecorder {
    pub fn new(store: Arc<ExperienceStore>) -> Self {
        Self { store, policy: None }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyUpdater>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn store(&self) -> &Arc<ExperienceStore> {
        &self.store
    }

    /// 写入经验并发送强化信号；返回的 Err 只代表学习失败，不影响 report.status
    pub fn learn(
        &self,
        instruction: &Instruction,
        plan: &Plan,
        report: &RunReport,
    ) -> Result<Arc<ExperienceRecord>, AgentError> {
        let stored = self
            .store
            .record_experience(instruction, plan, report, Some(reflect(report)));

        let signal = ReinforcementSignal::from_report(report, stored.as_ref().ok().map(|r| r.id));
        if let Some(policy) = &self.policy {
            policy.update(instruction, &signal);
        }

        match &stored {
            Ok(record) => tracing::info!(
                experience = record.id,
                status = %report.status,
                reward = signal.reinforcement.reward(),
                "experience learned"
            ),
            Err(e) => tracing::warn!(error = %e, status = %report.status, "failed to record experience"),
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use crate::memory::InMemoryBackend;
    use crate::plan::{ActionStep, Parameters, StepResult};

    fn step(kind: ActionKind) -> ActionStep {
        ActionStep::new(kind, Parameters::new(), kind.as_str())
    }

    fn report(outcomes: &[bool], planned: usize) -> RunReport {
        let kinds = [ActionKind::OpenApp, ActionKind::TypeText, ActionKind::PressKey];
        let plan = Plan::new(kinds.iter().take(planned).map(|k| step(*k)).collect());
        let results = outcomes
            .iter()
            .enumerate()
            .map(|(i, ok)| {
                if *ok {
                    StepResult::succeeded(i, step(kinds[i]), Parameters::new())
                } else {
                    StepResult::failed(i, step(kinds[i]), &AgentError::ActionDispatch("boom".into()))
                }
            })
            .collect();
        let error = outcomes
            .contains(&false)
            .then(|| AgentError::ActionDispatch("boom".into()));
        RunReport::finished(Instruction::new("open notepad"), plan, results, 0, error)
    }

    fn store() -> Arc<ExperienceStore> {
        Arc::new(
            ExperienceStore::open(Arc::new(InMemoryBackend), Arc::new(HashingEmbedder::new(32)))
                .unwrap(),
        )
    }

    #[test]
    fn test_reinforcement_polarity() {
        assert_eq!(Reinforcement::from_report(&report(&[true, true], 2)).reward(), 1.0);
        assert_eq!(Reinforcement::from_report(&report(&[false], 1)).reward(), -1.0);
        let partial = Reinforcement::from_report(&report(&[true, false], 3));
        assert_eq!(partial, Reinforcement::Partial { progress: 1.0 / 3.0 });
        assert_eq!(partial.reward(), 0.0);
    }

    #[test]
    fn test_reflection_mentions_halt() {
        let text = reflect(&report(&[true, false], 3));
        assert!(text.starts_with("Halted at step 2 of 3 (type_text)"));
        assert!(text.contains("action_dispatch"));
        assert!(reflect(&report(&[true, true], 2)).starts_with("Completed all 2 steps"));
    }

    #[test]
    fn test_learn_records_and_updates_ledger() {
        let ledger = Arc::new(RewardLedger::new());
        let recorder = FeedbackRecorder::new(store()).with_policy(ledger.clone());
        let rep = report(&[true, false], 3);
        let record = recorder.learn(&rep.instruction, &rep.plan, &rep).unwrap();
        assert_eq!(record.id, 1);
        assert!(record.reflection.as_deref().unwrap().contains("Halted"));
        assert_eq!(recorder.store().size(), 1);
        assert_eq!(ledger.stats(ActionKind::OpenApp).successes, 1);
        assert_eq!(ledger.stats(ActionKind::TypeText).failures, 1);
        assert_eq!(ledger.signal_count(), 1);
    }

    #[test]
    fn test_signal_sent_even_when_store_closed() {
        let ledger = Arc::new(RewardLedger::new());
        let store = store();
        store.close().unwrap();
        let recorder = FeedbackRecorder::new(store).with_policy(ledger.clone());
        let rep = report(&[true, true], 2);
        let err = recorder.learn(&rep.instruction, &rep.plan, &rep).unwrap_err();
        assert!(matches!(err, AgentError::StorageFailure(_)));
        assert_eq!(ledger.signal_count(), 1);
        assert_eq!(ledger.total_reward(), 1.0);
        assert_eq!(rep.status, RunStatus::Succeeded);
    }
}
