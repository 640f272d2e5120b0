//! 运行登记表：run_id → 状态 / 取消令牌
//!
//! 每次 submit 登记一条记录，执行过程中推进状态；get_status 供外部查询，cancel 触发该次运行的 CancellationToken。
//! 多个运行可并发，各自独立推进。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{RunState, RunStatus};

/// 运行 ID（登记表内单调递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

struct RunEntry {
    state: RunState,
    instruction: String,
    cancel: CancellationToken,
    registered_at: i64,
    finished_at: Option<i64>,
}

/// 对外可见的运行概要
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub instruction: String,
    pub status: RunStatus,
    pub registered_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Default)]
pub struct RunRegistry {
    next_id: AtomicU64,
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            runs: RwLock::new(HashMap::new()),
        }
    }

    // 登记表只保存状态快照，锁中毒时沿用内部数据并告警
    fn read_runs(&self) -> RwLockReadGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.read().unwrap_or_else(|e| {
            tracing::warn!("run registry lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn write_runs(&self) -> RwLockWriteGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.write().unwrap_or_else(|e| {
            tracing::warn!("run registry lock poisoned, recovering");
            e.into_inner()
        })
    }

    /// 登记新运行（Pending）
    pub fn register(&self, instruction: &str, cancel: CancellationToken) -> RunId {
        let run_id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed).max(1));
        let entry = RunEntry {
            state: RunState::new(),
            instruction: instruction.to_string(),
            cancel,
            registered_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
        };
        self.write_runs().insert(run_id, entry);
        run_id
    }

    /// 推进状态；非法迁移时记录警告并返回 false
    pub fn set_status(&self, run_id: RunId, status: RunStatus) -> bool {
        let mut runs = self.write_runs();
        let Some(entry) = runs.get_mut(&run_id) else {
            return false;
        };
        match entry.state.advance(status) {
            Ok(()) => {
                if status.is_terminal() {
                    entry.finished_at = Some(chrono::Utc::now().timestamp_millis());
                }
                true
            }
            Err(e) => {
                tracing::warn!(run = %run_id, "status update rejected: {}", e);
                false
            }
        }
    }

    pub fn get_status(&self, run_id: RunId) -> Option<RunStatus> {
        self.read_runs()
            .get(&run_id)
            .map(|e| e.state.status())
    }

    /// 请求取消；已结束或不存在的运行返回 false
    pub fn cancel(&self, run_id: RunId) -> bool {
        let runs = self.read_runs();
        match runs.get(&run_id) {
            Some(entry) if !entry.state.status().is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// 尚未到达终态的运行数
    pub fn active_count(&self) -> usize {
        self.read_runs()
            .values()
            .filter(|e| !e.state.status().is_terminal())
            .count()
    }

    pub fn list(&self) -> Vec<RunSummary> {
        let runs = self.read_runs();
        let mut out: Vec<RunSummary> = runs
            .iter()
            .map(|(id, e)| RunSummary {
                run_id: *id,
                instruction: e.instruction.clone(),
                status: e.state.status(),
                registered_at: e.registered_at,
                finished_at: e.finished_at,
            })
            .collect();
        out.sort_by_key(|s| s.run_id);
        out
    }

    /// 清理结束超过 max_age_ms 的运行记录，返回清理条数
    pub fn cleanup_finished(&self, max_age_ms: i64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis().saturating_sub(max_age_ms);
        let mut runs = self.write_runs();
        let before = runs.len();
        runs.retain(|_, e| e.finished_at.map(|f| f >= cutoff).unwrap_or(true));
        let removed = before - runs.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = runs.len(), "finished runs cleaned up");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_advance() {
        let registry = RunRegistry::new();
        let a = registry.register("open notepad", CancellationToken::new());
        let b = registry.register("press enter", CancellationToken::new());
        assert!(b > a);
        assert_eq!(registry.get_status(a), Some(RunStatus::Pending));
        assert!(registry.set_status(a, RunStatus::Running));
        assert_eq!(registry.active_count(), 2);
        assert!(registry.set_status(a, RunStatus::Succeeded));
        assert!(!registry.set_status(a, RunStatus::Running));
        assert_eq!(registry.get_status(a), Some(RunStatus::Succeeded));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_cancel_triggers_token() {
        let registry = RunRegistry::new();
        let token = CancellationToken::new();
        let id = registry.register("wait", token.clone());
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(RunId(999)));
    }

    #[test]
    fn test_cancel_after_finish_is_noop() {
        let registry = RunRegistry::new();
        let token = CancellationToken::new();
        let id = registry.register("wait", token.clone());
        registry.set_status(id, RunStatus::Failed);
        assert!(!registry.cancel(id));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cleanup_finished() {
        let registry = RunRegistry::new();
        let id = registry.register("x", CancellationToken::new());
        registry.set_status(id, RunStatus::Failed);
        let pending = registry.register("y", CancellationToken::new());
        assert_eq!(registry.cleanup_finished(-1_000), 1);
        assert_eq!(registry.get_status(id), None);
        assert_eq!(registry.get_status(pending), Some(RunStatus::Pending));
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let registry = std::sync::Arc::new(RunRegistry::new());
        let id = registry.register("open notepad", CancellationToken::new());
        let poisoner = std::sync::Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.runs.write().unwrap();
            panic!("poison the run map");
        })
        .join();
        assert!(registry.runs.is_poisoned());
        assert_eq!(registry.get_status(id), Some(RunStatus::Pending));
        assert!(registry.set_status(id, RunStatus::Running));
        let next = registry.register("press enter", CancellationToken::new());
        assert!(next > id);
        assert_eq!(registry.active_count(), 2);
    }
}
