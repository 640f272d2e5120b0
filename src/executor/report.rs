//! RunReport：单次执行尝试的完整结果
//!
//! 每次尝试恰好产出一份；终态确定后只允许追加存储层警告，status 不再改变。

use serde::{Deserialize, Serialize};

use crate::core::{AgentError, ErrorInfo, RunId, RunStatus};
use crate::plan::{Instruction, Plan, StepResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub instruction: Instruction,
    pub plan: Plan,
    pub step_results: Vec<StepResult>,
    pub status: RunStatus,
    /// epoch 毫秒
    pub started_at: i64,
    pub ended_at: i64,
    /// 人类可读的结果说明；失败时必有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 终止原因（首个失败步骤的错误、取消、规划失败等）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// 次要警告（经验库写入失败等），不影响 status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunReport {
    /// 由执行结果构造终态报告；status 由结果推导
    pub fn finished(
        instruction: Instruction,
        plan: Plan,
        step_results: Vec<StepResult>,
        started_at: i64,
        error: Option<AgentError>,
    ) -> Self {
        let status = RunStatus::from_results(plan.len(), &step_results);
        let message = match (&status, &error) {
            (RunStatus::Succeeded, _) => {
                Some(format!("Completed all {} steps", step_results.len()))
            }
            (_, Some(e)) => Some(match step_results.len() {
                0 => format!("Stopped before any step: {e}"),
                n => format!("Stopped after {} of {} steps: {e}", n, plan.len()),
            }),
            (_, None) => Some(format!(
                "Stopped after {} of {} steps",
                step_results.len(),
                plan.len()
            )),
        };
        Self {
            run_id: None,
            instruction,
            plan,
            step_results,
            status,
            started_at,
            ended_at: chrono::Utc::now().timestamp_millis(),
            message,
            error: error.map(|e| e.to_info()),
            warnings: Vec::new(),
        }
    }

    /// 规划阶段失败（校验错误或 oracle 故障）：空计划、无步骤结果、Failed
    pub fn planning_failed(instruction: Instruction, error: &AgentError, started_at: i64) -> Self {
        Self {
            run_id: None,
            instruction,
            plan: Plan::empty(),
            step_results: Vec::new(),
            status: RunStatus::Failed,
            started_at,
            ended_at: chrono::Utc::now().timestamp_millis(),
            message: Some(error.to_string()),
            error: Some(error.to_info()),
            warnings: Vec::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn attach_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn succeeded_steps(&self) -> usize {
        self.step_results.iter().filter(|r| r.success).count()
    }

    /// 首个失败步骤的位置
    pub fn failed_at(&self) -> Option<usize> {
        self.step_results.iter().find(|r| !r.success).map(|r| r.index)
    }

    /// 是否在计划执行完之前停止
    pub fn halted_early(&self) -> bool {
        self.step_results.len() < self.plan.len()
    }

    pub fn duration_ms(&self) -> i64 {
        self.ended_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::plan::{ActionKind, ActionStep, Parameters};

    fn step(kind: ActionKind) -> ActionStep {
        ActionStep::new(kind, Parameters::new(), kind.as_str())
    }

    #[test]
    fn test_finished_derives_status() {
        let plan = Plan::new(vec![step(ActionKind::Wait), step(ActionKind::Scroll)]);
        let results = vec![StepResult::succeeded(0, step(ActionKind::Wait), Parameters::new())];
        let err = AgentError::Cancelled("stop".into());
        let report = RunReport::finished(Instruction::new("x"), plan, results, 0, Some(err));
        assert_eq!(report.status, RunStatus::PartiallyCompleted);
        assert!(report.halted_early());
        assert_eq!(report.error.unwrap().kind, ErrorKind::CancellationRequested);
    }

    #[test]
    fn test_planning_failed_report() {
        let err = AgentError::PlanningFailure("oracle down".into());
        let report = RunReport::planning_failed(Instruction::new("x"), &err, 0);
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.plan.is_empty());
        assert!(report.step_results.is_empty());
        assert!(report.message.unwrap().contains("oracle down"));
    }

    #[test]
    fn test_warnings_skip_when_empty() {
        let err = AgentError::Validation("empty".into());
        let mut report = RunReport::planning_failed(Instruction::new(""), &err, 0);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("warnings").is_none());
        report.attach_warning("storage failure");
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.warnings.len(), 1);
    }
}
