//! 端到端场景：规划 → 执行 → 学习，感知与动作均为测试替身

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use deskpilot::action::ActionDispatcher;
    use deskpilot::config::AppConfig;
    use deskpilot::core::{ErrorKind, RunStatus};
    use deskpilot::executor::{ExecutionConfig, ExecutionController};
    use deskpilot::llm::HashingEmbedder;
    use deskpilot::memory::{ExperienceStore, InMemoryBackend};
    use deskpilot::perception::{ElementHandle, EnvironmentSnapshot, Perception};
    use deskpilot::plan::{ActionKind, ActionStep, Instruction, KindRegistry, Parameters, Plan};
    use deskpilot::planner::{Planner, RuleOracle};
    use deskpilot::Agent;

    struct AlwaysFinds;

    #[async_trait]
    impl Perception for AlwaysFinds {
        async fn get_current_state(&self) -> Result<EnvironmentSnapshot, String> {
            Ok(EnvironmentSnapshot::blank())
        }

        async fn find_element(&self, _properties: &Parameters) -> Result<Option<ElementHandle>, String> {
            Ok(Some(ElementHandle::new("field", "textfield", "Editor input", [0, 0, 100, 20])))
        }
    }

    /// 第 fail_on 次 perform 失败；cancel_after 次成功后触发取消令牌
    #[derive(Default)]
    struct ScriptedAction {
        calls: AtomicUsize,
        fail_on: Option<usize>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedAction {
        fn failing_on(call: usize) -> Self {
            Self {
                fail_on: Some(call),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ActionDispatcher for ScriptedAction {
        async fn perform(
            &self,
            kind: ActionKind,
            _parameters: &Parameters,
            _snapshot: &EnvironmentSnapshot,
        ) -> Result<Parameters, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(n) {
                return Err(format!("{kind} rejected by driver"));
            }
            if let Some((after, token)) = &self.cancel_after {
                if n == *after {
                    token.cancel();
                }
            }
            Ok(Parameters::new())
        }
    }

    fn controller(action: ScriptedAction) -> ExecutionController {
        ExecutionController::new(
            Arc::new(AlwaysFinds),
            Arc::new(action),
            ExecutionConfig {
                step_timeout: Duration::from_secs(1),
                perception_timeout: Duration::from_secs(1),
                max_recovery_attempts: 0,
            },
        )
    }

    fn key_plan(n: usize) -> Plan {
        Plan::new(
            (0..n)
                .map(|i| {
                    ActionStep::new(
                        ActionKind::PressKey,
                        serde_json::json!({"key_name": format!("f{}", i + 1)})
                            .as_object()
                            .cloned()
                            .unwrap(),
                        format!("Press f{}", i + 1),
                    )
                })
                .collect(),
        )
    }

    const SCENARIO: &str = "open a text editor and type hello";

    #[tokio::test]
    async fn scenario_a_plan_and_execute_without_history() {
        let planner = Planner::new(Arc::new(RuleOracle::new()), KindRegistry::new());
        let instruction = Instruction::new(SCENARIO);
        let plan = planner.create_plan(&instruction, &[], None).await.unwrap();
        assert!(!plan.is_empty());
        assert!(!plan.is_fallback());

        let report = controller(ScriptedAction::default())
            .execute_plan(&instruction, &plan, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.step_results.len(), plan.len());
    }

    #[tokio::test]
    async fn scenario_b_second_of_three_fails() {
        let report = controller(ScriptedAction::failing_on(2))
            .execute_plan(&Instruction::new(SCENARIO), &key_plan(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::PartiallyCompleted);
        assert_eq!(report.step_results.len(), 2);
        assert!(!report.step_results[1].success);
        assert_eq!(
            report.step_results[1].error.as_ref().unwrap().kind,
            ErrorKind::ActionDispatch
        );
    }

    #[tokio::test]
    async fn scenario_c_single_step_failure() {
        let report = controller(ScriptedAction::failing_on(1))
            .execute_plan(&Instruction::new("press f1"), &key_plan(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.step_results.len(), 1);
        assert!(report.message.is_some());
    }

    #[tokio::test]
    async fn scenario_e_cancel_before_second_step() {
        let token = CancellationToken::new();
        let action = ScriptedAction {
            cancel_after: Some((1, token.clone())),
            ..ScriptedAction::default()
        };
        let report = controller(action)
            .execute_plan(&Instruction::new("press keys"), &key_plan(3), &token)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::PartiallyCompleted);
        assert_eq!(report.step_results.len(), 1);
        assert_eq!(report.error.unwrap().kind, ErrorKind::CancellationRequested);
    }

    #[tokio::test]
    async fn first_failure_at_k_yields_k_results() {
        let n = 4;
        for k in 1..=n {
            let report = controller(ScriptedAction::failing_on(k))
                .execute_plan(&Instruction::new("keys"), &key_plan(n), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(report.step_results.len(), k);
            let expected = if k == 1 {
                RunStatus::Failed
            } else {
                RunStatus::PartiallyCompleted
            };
            assert_eq!(report.status, expected, "first failure at step {k}");
        }

        let report = controller(ScriptedAction::default())
            .execute_plan(&Instruction::new("keys"), &key_plan(n), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.step_results.len(), n);
    }

    fn agent(action: ScriptedAction) -> Agent {
        let store = Arc::new(
            ExperienceStore::open(Arc::new(InMemoryBackend), Arc::new(HashingEmbedder::new(64)))
                .unwrap(),
        );
        Agent::new(
            AppConfig::default(),
            store,
            Arc::new(RuleOracle::new()),
            Arc::new(AlwaysFinds),
            Arc::new(action),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_instruction_uses_generic_fallback() {
        let agent = agent(ScriptedAction::failing_on(1));
        let report = agent.submit("rearrange my desktop icons by colour").await;
        assert!(report.plan.is_fallback());
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(agent.store().size(), 1);
    }

    #[tokio::test]
    async fn learned_experience_is_retrievable() {
        let agent = agent(ScriptedAction::default());
        let report = agent.submit(SCENARIO).await;
        assert_eq!(report.status, RunStatus::Succeeded);

        let hits = agent.store().retrieve_relevant(SCENARIO, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].plan, report.plan);
        assert!(hits[0].reflection.as_deref().unwrap().starts_with("Completed"));
        assert!(agent.ledger().total_reward() > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_share_the_store() {
        let agent = Arc::new(agent(ScriptedAction::default()));
        let handles: Vec<_> = (0..6)
            .map(|i| agent.start(format!("press f{}", i + 1)))
            .collect();
        for (run_id, handle) in handles {
            let report = handle.await.unwrap();
            assert_eq!(report.status, RunStatus::Succeeded);
            assert_eq!(agent.get_status(run_id), Some(RunStatus::Succeeded));
        }
        assert_eq!(agent.store().size(), 6);
        assert_eq!(agent.status().active_runs, 0);
    }
}
