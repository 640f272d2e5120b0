//! 经验库集成测试：检索幂等、往返、SQLite 重启后 id 不复用且命中数保留、并发追加

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use deskpilot::core::{AgentError, RunStatus};
    use deskpilot::executor::RunReport;
    use deskpilot::llm::HashingEmbedder;
    use deskpilot::memory::{
        ExperienceBackend, ExperienceStore, InMemoryBackend, RetentionPolicy, SqliteBackend,
    };
    use deskpilot::plan::{ActionKind, ActionStep, Instruction, Parameters, Plan, StepResult};

    fn memory_store() -> ExperienceStore {
        ExperienceStore::open(Arc::new(InMemoryBackend), Arc::new(HashingEmbedder::new(128)))
            .unwrap()
    }

    fn sqlite_store(path: &std::path::Path) -> ExperienceStore {
        let backend: Arc<dyn ExperienceBackend> = Arc::new(SqliteBackend::open(path).unwrap());
        ExperienceStore::open(backend, Arc::new(HashingEmbedder::new(128))).unwrap()
    }

    fn record(store: &ExperienceStore, text: &str) -> u64 {
        let instruction = Instruction::new(text);
        let step = ActionStep::new(
            ActionKind::PressKey,
            serde_json::json!({"key_name": "enter"}).as_object().cloned().unwrap(),
            "Press enter",
        );
        let plan = Plan::new(vec![step.clone()]);
        let report = RunReport::finished(
            instruction.clone(),
            plan.clone(),
            vec![StepResult::succeeded(0, step, Parameters::new())],
            0,
            None,
        );
        store
            .record_experience(&instruction, &plan, &report, None)
            .unwrap()
            .id
    }

    #[test]
    fn test_empty_store_returns_nothing() {
        let store = memory_store();
        assert!(store.retrieve_relevant("unrelated query", 3).unwrap().is_empty());
    }

    #[test]
    fn test_top_k_zero_is_empty() {
        let store = memory_store();
        record(&store, "open the browser");
        assert!(store.retrieve_relevant("open the browser", 0).unwrap().is_empty());
    }

    #[test]
    fn test_size_grows_and_ids_increase() {
        let store = memory_store();
        let initial = store.size();
        let ids: Vec<u64> = (0..5).map(|i| record(&store, &format!("task {i}"))).collect();
        assert_eq!(store.size(), initial + 5);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_retrieval_is_idempotent() {
        let store = memory_store();
        for text in ["open notepad", "type hello", "press enter", "scroll down", "open notepad and type hi"] {
            record(&store, text);
        }
        let first: Vec<u64> = store
            .retrieve_relevant("open notepad", 3)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        let second: Vec<u64> = store
            .retrieve_relevant("open notepad", 3)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_exact_instruction_round_trip() {
        let store = memory_store();
        record(&store, "scroll down the page");
        let id = record(&store, "打开记事本并输入你好");
        record(&store, "press escape");
        let results = store.retrieve_relevant("打开记事本并输入你好", 1).unwrap();
        assert_eq!(results[0].id, id);
        assert_eq!(results[0].status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_sqlite_restart_keeps_order_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("experience.db");

        let (first, last) = {
            let store = sqlite_store(&path);
            let first = record(&store, "open the browser");
            record(&store, "type hello");
            let last = record(&store, "press enter");
            // 超出容量时淘汰最旧一条；重启后 id 仍不得复用
            let report = store
                .prune(&RetentionPolicy::keep_all().with_max_records(2))
                .unwrap();
            assert_eq!(report.removed_ids, vec![first]);
            store.close().unwrap();
            (first, last)
        };

        let store = sqlite_store(&path);
        assert_eq!(store.size(), 2);
        assert!(store.get(first).is_none());
        assert_eq!(store.get(last).unwrap().instruction.text, "press enter");
        let next = record(&store, "open notepad");
        assert!(next > last);
    }

    #[test]
    fn test_hits_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experience.db");
        let (used, unused) = {
            let store = sqlite_store(&path);
            let used = record(&store, "open the browser");
            let unused = record(&store, "scroll down the page");
            for _ in 0..5 {
                store.retrieve_relevant("open the browser", 1).unwrap();
            }
            assert_eq!(store.hits(used), Some(5));
            store.close().unwrap();
            (used, unused)
        };

        let store = sqlite_store(&path);
        assert_eq!(store.hits(used), Some(5));
        assert_eq!(store.hits(unused), Some(0));
        std::thread::sleep(Duration::from_millis(20));
        let report = store
            .prune(&RetentionPolicy::keep_all().with_min_hits(1, Duration::from_millis(5)))
            .unwrap();
        assert_eq!(report.removed_ids, vec![unused]);
        assert!(store.get(used).is_some());
    }

    #[test]
    fn test_error_ids_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experience.db");
        let first = {
            let store = sqlite_store(&path);
            let err = AgentError::PlanningFailure("oracle offline".into());
            store
                .record_error(&Instruction::new("x"), None, err.to_info())
                .unwrap()
                .id
        };
        let store = sqlite_store(&path);
        let err = AgentError::Validation("instruction is empty".into());
        let second = store
            .record_error(&Instruction::new(""), None, err.to_info())
            .unwrap();
        assert!(second.id > first);
        assert_eq!(store.error_count(), 2);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_prune_removes_expired() {
        let store = memory_store();
        record(&store, "old task");
        std::thread::sleep(Duration::from_millis(20));
        let report = store
            .prune(&RetentionPolicy::keep_all().with_max_age(Duration::from_millis(5)))
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(store.size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_and_reads() {
        let store = Arc::new(memory_store());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..10 {
                    ids.push(record(&store, &format!("worker {worker} task {i}")));
                    let hits = store.retrieve_relevant("worker task", 5).unwrap();
                    assert!(hits.iter().all(|r| !r.instruction.text.is_empty()));
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            let ids = handle.await.unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        assert_eq!(all.len(), 80);
        assert_eq!(store.size(), 80);
    }
}
