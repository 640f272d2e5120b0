//! 规划层：指令 + 检索到的经验 + 环境快照 → Plan
//!
//! - 空指令 → Validation
//! - oracle 故障 → PlanningFailure（不编造计划）
//! - oracle 给出步骤 → 逐条经 KindRegistry 校验，任一不合法 → PlanningFailure
//! - oracle 无建议 → 复用同指令的成功经验；仍无 → 单个 generic 兜底步骤
//!
//! 对任何非空指令都返回非空 Plan。

pub mod llm_oracle;
pub mod oracle;
pub mod rules;

use std::sync::Arc;

use serde::Serialize;

use crate::core::AgentError;
use crate::memory::ExperienceRecord;
use crate::perception::EnvironmentSnapshot;
use crate::plan::{ActionStep, Instruction, KindRegistry, Plan};

pub use llm_oracle::{parse_plan_output, LlmOracle};
pub use oracle::{OracleError, PlanningContext, PlanningOracle};
pub use rules::RuleOracle;

/// 计划来源，便于日志与调试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "experience_id")]
pub enum PlanOrigin {
    Oracle,
    Replay(u64),
    Fallback,
}

pub struct Planner {
    oracle: Arc<dyn PlanningOracle>,
    registry: KindRegistry,
    replay_experience: bool,
}

impl Planner {
    pub fn new(oracle: Arc<dyn PlanningOracle>, registry: KindRegistry) -> Self {
        Self {
            oracle,
            registry,
            replay_experience: true,
        }
    }

    pub fn with_replay(mut self, enabled: bool) -> Self {
        self.replay_experience = enabled;
        self
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    pub async fn create_plan(
        &self,
        instruction: &Instruction,
        experiences: &[Arc<ExperienceRecord>],
        snapshot: Option<&EnvironmentSnapshot>,
    ) -> Result<Plan, AgentError> {
        self.create_plan_traced(instruction, experiences, snapshot)
            .await
            .map(|(plan, _)| plan)
    }

    /// 同 create_plan，额外返回计划来源
    pub async fn create_plan_traced(
        &self,
        instruction: &Instruction,
        experiences: &[Arc<ExperienceRecord>],
        snapshot: Option<&EnvironmentSnapshot>,
    ) -> Result<(Plan, PlanOrigin), AgentError> {
        if instruction.text.trim().is_empty() {
            return Err(AgentError::Validation("instruction is empty".to_string()));
        }

        let enabled_kinds = self.registry.enabled_kinds();
        let context = PlanningContext {
            experiences,
            snapshot,
            enabled_kinds: &enabled_kinds,
        };
        let candidates = self
            .oracle
            .generate(instruction, &context)
            .await
            .map_err(|e| AgentError::PlanningFailure(format!("{}: {}", self.oracle.name(), e)))?;

        if !candidates.is_empty() {
            let steps = candidates
                .into_iter()
                .enumerate()
                .map(|(i, candidate)| {
                    self.registry.validate(candidate).map_err(|e| {
                        AgentError::PlanningFailure(format!(
                            "{} proposed an unusable step {}: {}",
                            self.oracle.name(),
                            i + 1,
                            e
                        ))
                    })
                })
                .collect::<Result<Vec<ActionStep>, AgentError>>()?;
            tracing::info!(steps = steps.len(), oracle = self.oracle.name(), "plan created");
            return Ok((Plan::new(steps), PlanOrigin::Oracle));
        }

        if self.replay_experience {
            if let Some(record) = self.find_replayable(instruction, experiences) {
                tracing::info!(
                    experience = record.id,
                    steps = record.plan.len(),
                    "replaying plan from past success"
                );
                return Ok((record.plan.clone(), PlanOrigin::Replay(record.id)));
            }
        }

        tracing::info!("no strategy for instruction, using generic fallback step");
        Ok((
            Plan::new(vec![ActionStep::generic(&instruction.text)]),
            PlanOrigin::Fallback,
        ))
    }

    /// 检索结果中同指令（归一化后）、执行成功、且所有步骤类型仍启用的经验
    fn find_replayable<'a>(
        &self,
        instruction: &Instruction,
        experiences: &'a [Arc<ExperienceRecord>],
    ) -> Option<&'a Arc<ExperienceRecord>> {
        let normalized = instruction.normalized();
        experiences.iter().find(|r| {
            r.succeeded()
                && !r.plan.is_empty()
                && !r.plan.is_fallback()
                && r.instruction.normalized() == normalized
                && r.plan.iter().all(|s| self.registry.is_enabled(s.kind))
        })
    }
}
