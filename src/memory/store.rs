//! 经验库：只追加的经验日志 + 错误日志，按指令嵌入做相似度检索
//!
//! 并发模型：
//! - 追加是一次写锁临界区（分配 id → 落盘 → 入表），id 严格递增且不复用
//! - 检索在读锁内只复制 Arc 快照，打分与排序在锁外进行；结果持有 Arc，后续 prune 不影响它
//! - prune 持写锁，跳过仍被检索结果引用的记录
//! - 命中次数随检索写回后端，重启后按保存的值恢复

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::core::{AgentError, ErrorInfo};
use crate::executor::RunReport;
use crate::llm::EmbeddingProvider;
use crate::memory::backend::ExperienceBackend;
use crate::memory::experience::{summarize, ErrorRecord, ExperienceRecord, Summary};
use crate::memory::retention::{PruneReason, RetentionPolicy};
use crate::plan::{Instruction, Plan};

#[derive(Clone)]
struct Entry {
    record: Arc<ExperienceRecord>,
    hits: Arc<AtomicU64>,
}

struct ExperienceLog {
    entries: Vec<Entry>,
    next_id: u64,
}

struct ErrorLog {
    records: Vec<Arc<ErrorRecord>>,
    next_id: u64,
}

/// 一次 prune 的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub removed_ids: Vec<u64>,
    pub expired: usize,
    pub low_hits: usize,
    pub over_capacity: usize,
    /// 因仍被检索结果引用而本轮跳过的记录数
    pub skipped_in_use: usize,
    pub remaining: usize,
}

pub struct ExperienceStore {
    backend: Arc<dyn ExperienceBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    experiences: RwLock<ExperienceLog>,
    errors: RwLock<ErrorLog>,
    closed: AtomicBool,
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::StorageFailure("experience store lock poisoned".to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 相似度降序，其次时间戳降序，最后 id 降序（保证全序，检索结果可重复）
fn rank(a: &(f32, Entry), b: &(f32, Entry)) -> CmpOrdering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(CmpOrdering::Equal)
        .then_with(|| b.1.record.timestamp.cmp(&a.1.record.timestamp))
        .then_with(|| b.1.record.id.cmp(&a.1.record.id))
}

impl ExperienceStore {
    /// 从后端恢复记录；嵌入维度与当前 embedder 不一致的记录会重新编码（仅内存中）
    pub fn open(
        backend: Arc<dyn ExperienceBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, AgentError> {
        let state = backend.load()?;
        let dim = embedder.dim();
        let mut entries = Vec::with_capacity(state.experiences.len());
        for mut record in state.experiences {
            let hits = state.hits.get(&record.id).copied().unwrap_or(0);
            if record.embedding.len() != dim {
                record.embedding = embedder
                    .embed_sync(&record.instruction.text)
                    .map_err(|e| AgentError::StorageFailure(format!("embedding failed: {e}")))?;
            }
            entries.push(Entry {
                record: Arc::new(record),
                hits: Arc::new(AtomicU64::new(hits)),
            });
        }
        tracing::info!(
            backend = backend.name(),
            experiences = entries.len(),
            errors = state.errors.len(),
            "experience store opened"
        );
        Ok(Self {
            backend,
            embedder,
            experiences: RwLock::new(ExperienceLog {
                entries,
                next_id: state.next_experience_id.max(1),
            }),
            errors: RwLock::new(ErrorLog {
                records: state.errors.into_iter().map(Arc::new).collect(),
                next_id: state.next_error_id.max(1),
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn read_log(&self) -> Result<RwLockReadGuard<'_, ExperienceLog>, AgentError> {
        self.experiences.read().map_err(poisoned)
    }

    fn write_log(&self) -> Result<RwLockWriteGuard<'_, ExperienceLog>, AgentError> {
        self.experiences.write().map_err(poisoned)
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AgentError::StorageFailure(
                "experience store is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        let vec = self
            .embedder
            .embed_sync(text)
            .map_err(|e| AgentError::StorageFailure(format!("embedding failed: {e}")))?;
        if vec.len() != self.embedder.dim() {
            return Err(AgentError::StorageFailure(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.embedder.dim(),
                vec.len()
            )));
        }
        Ok(vec)
    }

    /// 追加一条经验；后端写入失败时不分配 id、不入表
    pub fn record_experience(
        &self,
        instruction: &Instruction,
        plan: &Plan,
        run_report: &RunReport,
        reflection: Option<String>,
    ) -> Result<Arc<ExperienceRecord>, AgentError> {
        self.ensure_open()?;
        let embedding = self.embed(&instruction.text)?;

        let mut log = self.write_log()?;
        let record = ExperienceRecord {
            id: log.next_id,
            timestamp: now_ms(),
            instruction: instruction.clone(),
            plan: plan.clone(),
            run_report: run_report.clone(),
            reflection,
            embedding,
        };
        self.backend.append_experience(&record)?;
        log.next_id += 1;
        let record = Arc::new(record);
        log.entries.push(Entry {
            record: Arc::clone(&record),
            hits: Arc::new(AtomicU64::new(0)),
        });
        tracing::debug!(id = record.id, status = %record.status(), "experience recorded");
        Ok(record)
    }

    pub fn record_error(
        &self,
        instruction: &Instruction,
        plan: Option<&Plan>,
        error_detail: ErrorInfo,
    ) -> Result<Arc<ErrorRecord>, AgentError> {
        self.ensure_open()?;
        let mut log = self.errors.write().map_err(poisoned)?;
        let record = ErrorRecord {
            id: log.next_id,
            timestamp: now_ms(),
            instruction: instruction.clone(),
            plan: plan.cloned(),
            error_detail,
        };
        self.backend.append_error(&record)?;
        log.next_id += 1;
        let record = Arc::new(record);
        log.records.push(Arc::clone(&record));
        tracing::debug!(id = record.id, kind = %record.error_detail.kind, "error recorded");
        Ok(record)
    }

    /// 按相似度取前 top_k 条；top_k = 0 或库为空时返回空序列
    pub fn retrieve_relevant(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Arc<ExperienceRecord>>, AgentError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let snapshot: Vec<Entry> = self.read_log()?.entries.clone();
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embed(query)?;

        let mut scored: Vec<(f32, Entry)> = snapshot
            .into_iter()
            .map(|e| (cosine_similarity(&query_vec, &e.record.embedding), e))
            .collect();
        if scored.len() > top_k {
            scored.select_nth_unstable_by(top_k - 1, rank);
            scored.truncate(top_k);
        }
        scored.sort_by(rank);

        let results: Vec<Arc<ExperienceRecord>> = scored
            .into_iter()
            .map(|(_, e)| {
                e.hits.fetch_add(1, Ordering::Relaxed);
                e.record
            })
            .collect();
        if !self.is_closed() {
            let ids: Vec<u64> = results.iter().map(|r| r.id).collect();
            // 命中计数写回失败不影响本次检索
            if let Err(e) = self.backend.record_hits(&ids) {
                tracing::warn!(error = %e, "failed to persist retrieval hits");
            }
        }
        tracing::debug!(
            top_k,
            returned = results.len(),
            "retrieved experiences"
        );
        Ok(results)
    }

    pub fn summarize(&self, records: &[Arc<ExperienceRecord>]) -> Summary {
        summarize(records.iter().map(|r| r.as_ref()))
    }

    /// 对全库做模式摘要
    pub fn summarize_all(&self) -> Result<Summary, AgentError> {
        let snapshot: Vec<Arc<ExperienceRecord>> = self
            .read_log()?
            .entries
            .iter()
            .map(|e| Arc::clone(&e.record))
            .collect();
        Ok(self.summarize(&snapshot))
    }

    /// 按保留策略清理；仍被检索结果持有的记录本轮跳过
    pub fn prune(&self, policy: &RetentionPolicy) -> Result<PruneReport, AgentError> {
        self.ensure_open()?;
        let mut log = self.write_log()?;
        let now = now_ms();
        let mut report = PruneReport::default();

        let mut verdicts: Vec<Option<PruneReason>> = log
            .entries
            .iter()
            .map(|e| policy.evaluate(e.record.timestamp, e.hits.load(Ordering::Relaxed), now))
            .collect();

        if let Some(max) = policy.max_records {
            let mut surviving = verdicts.iter().filter(|v| v.is_none()).count();
            // entries 按 id 升序，从最旧的开始淘汰
            for verdict in verdicts.iter_mut() {
                if surviving <= max {
                    break;
                }
                if verdict.is_none() {
                    *verdict = Some(PruneReason::OverCapacity);
                    surviving -= 1;
                }
            }
        }

        let mut remove = vec![false; log.entries.len()];
        for (i, (entry, verdict)) in log.entries.iter().zip(&verdicts).enumerate() {
            let Some(reason) = verdict else { continue };
            // 只有库自身持有时 strong_count == 1
            if Arc::strong_count(&entry.record) > 1 {
                report.skipped_in_use += 1;
                continue;
            }
            match reason {
                PruneReason::Expired => report.expired += 1,
                PruneReason::LowHits => report.low_hits += 1,
                PruneReason::OverCapacity => report.over_capacity += 1,
            }
            remove[i] = true;
            report.removed_ids.push(entry.record.id);
        }

        self.backend.remove_experiences(&report.removed_ids)?;
        let mut flags = remove.into_iter();
        log.entries.retain(|_| !flags.next().unwrap_or(false));
        report.remaining = log.entries.len();

        if !report.removed_ids.is_empty() || report.skipped_in_use > 0 {
            tracing::info!(
                removed = report.removed_ids.len(),
                skipped_in_use = report.skipped_in_use,
                remaining = report.remaining,
                "experience store pruned"
            );
        }
        Ok(report)
    }

    pub fn size(&self) -> usize {
        self.read_log().map(|log| log.entries.len()).unwrap_or(0)
    }

    pub fn error_count(&self) -> usize {
        self.errors.read().map(|log| log.records.len()).unwrap_or(0)
    }

    pub fn errors(&self) -> Result<Vec<Arc<ErrorRecord>>, AgentError> {
        Ok(self.errors.read().map_err(poisoned)?.records.clone())
    }

    pub fn get(&self, id: u64) -> Option<Arc<ExperienceRecord>> {
        let log = self.read_log().ok()?;
        log.entries
            .binary_search_by_key(&id, |e| e.record.id)
            .ok()
            .map(|i| Arc::clone(&log.entries[i].record))
    }

    /// 某条记录累计被检索命中的次数
    pub fn hits(&self, id: u64) -> Option<u64> {
        let log = self.read_log().ok()?;
        log.entries
            .binary_search_by_key(&id, |e| e.record.id)
            .ok()
            .map(|i| log.entries[i].hits.load(Ordering::Relaxed))
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedder.dim()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 关闭后端；之后的写入返回 StorageFailure，已加载的记录仍可检索
    pub fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // 等待进行中的追加完成
        let _log = self.write_log()?;
        let _errors = self.errors.write().map_err(poisoned)?;
        self.backend.close()?;
        tracing::info!(backend = self.backend.name(), "experience store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, RunStatus};
    use crate::llm::HashingEmbedder;
    use crate::memory::backend::InMemoryBackend;
    use crate::plan::{ActionKind, ActionStep, Parameters, StepResult};

    fn store() -> ExperienceStore {
        ExperienceStore::open(Arc::new(InMemoryBackend), Arc::new(HashingEmbedder::new(64)))
            .unwrap()
    }

    fn run(text: &str) -> (Instruction, Plan, RunReport) {
        let instruction = Instruction::new(text);
        let step = ActionStep::new(ActionKind::Wait, Parameters::new(), "wait");
        let plan = Plan::new(vec![step.clone()]);
        let report = RunReport::finished(
            instruction.clone(),
            plan.clone(),
            vec![StepResult::succeeded(0, step, Parameters::new())],
            0,
            None,
        );
        (instruction, plan, report)
    }

    fn record(store: &ExperienceStore, text: &str) -> Arc<ExperienceRecord> {
        let (i, p, r) = run(text);
        store.record_experience(&i, &p, &r, None).unwrap()
    }

    #[test]
    fn test_ids_strictly_increase() {
        let store = store();
        let a = record(&store, "open notepad");
        let b = record(&store, "open browser");
        assert!(b.id > a.id);
        assert_eq!(store.size(), 2);
        assert_eq!(a.status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_retrieve_orders_by_similarity() {
        let store = store();
        record(&store, "scroll down the page");
        let target = record(&store, "open text editor and type hello");
        let results = store.retrieve_relevant("open text editor and type hello", 2).unwrap();
        assert_eq!(results[0].id, target.id);
        assert!(store.retrieve_relevant("anything", 0).unwrap().is_empty());
        assert_eq!(store.hits(target.id), Some(1));
    }

    #[test]
    fn test_ties_prefer_most_recent() {
        let store = store();
        let older = record(&store, "press enter");
        let newer = record(&store, "press enter");
        let results = store.retrieve_relevant("press enter", 2).unwrap();
        assert_eq!(results[0].id, newer.id);
        assert_eq!(results[1].id, older.id);
    }

    #[test]
    fn test_record_error_separate_log() {
        let store = store();
        let info = ErrorInfo {
            kind: ErrorKind::PlanningFailure,
            message: "oracle down".into(),
        };
        let e = store.record_error(&Instruction::new("x"), None, info).unwrap();
        assert_eq!(e.id, 1);
        assert_eq!(store.error_count(), 1);
        assert_eq!(store.size(), 0);
        assert!(store.retrieve_relevant("x", 3).unwrap().is_empty());
    }

    #[test]
    fn test_prune_skips_records_in_use() {
        let store = store();
        record(&store, "open notepad");
        record(&store, "open browser");
        let held = store.retrieve_relevant("open browser", 1).unwrap();
        let policy = RetentionPolicy::keep_all().with_max_records(0);
        let report = store.prune(&policy).unwrap();
        assert_eq!(report.skipped_in_use, 1);
        assert_eq!(report.over_capacity, 1);
        assert_eq!(store.size(), 1);
        assert_eq!(held[0].instruction.text, "open browser");

        drop(held);
        let report = store.prune(&policy).unwrap();
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_close_rejects_writes() {
        let store = store();
        store.close().unwrap();
        let (i, p, r) = run("open notepad");
        assert!(matches!(
            store.record_experience(&i, &p, &r, None),
            Err(AgentError::StorageFailure(_))
        ));
    }
}
