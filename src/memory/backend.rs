//! 经验库持久化后端
//!
//! ExperienceStore 在内存中持有全部记录，后端只负责落盘与重启恢复：
//! - InMemoryBackend：不落盘（测试、临时运行）
//! - SqliteBackend：`experiences` / `errors` 两张只追加表 + `counters` 表记录下一个 id，
//!   保证删除（prune）后重启也不会复用 id；检索命中次数存于 `experiences.hits`

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::AgentError;
use crate::memory::{ErrorRecord, ExperienceRecord};

/// 打开后端时恢复的状态（按 id 升序）
#[derive(Debug, Default)]
pub struct LoadedState {
    pub experiences: Vec<ExperienceRecord>,
    pub errors: Vec<ErrorRecord>,
    pub next_experience_id: u64,
    pub next_error_id: u64,
    /// 经验 id → 累计检索命中次数
    pub hits: HashMap<u64, u64>,
}

pub trait ExperienceBackend: Send + Sync {
    fn load(&self) -> Result<LoadedState, AgentError>;

    /// 写入一条经验并推进计数器；必须整体成功或整体失败
    fn append_experience(&self, record: &ExperienceRecord) -> Result<(), AgentError>;

    fn append_error(&self, record: &ErrorRecord) -> Result<(), AgentError>;

    fn remove_experiences(&self, ids: &[u64]) -> Result<(), AgentError>;

    /// 给这些经验的命中次数各加一
    fn record_hits(&self, _ids: &[u64]) -> Result<(), AgentError> {
        Ok(())
    }

    fn close(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct InMemoryBackend;

impl ExperienceBackend for InMemoryBackend {
    fn load(&self) -> Result<LoadedState, AgentError> {
        Ok(LoadedState {
            next_experience_id: 1,
            next_error_id: 1,
            ..LoadedState::default()
        })
    }

    fn append_experience(&self, _record: &ExperienceRecord) -> Result<(), AgentError> {
        Ok(())
    }

    fn append_error(&self, _record: &ErrorRecord) -> Result<(), AgentError> {
        Ok(())
    }

    fn remove_experiences(&self, _ids: &[u64]) -> Result<(), AgentError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

const EXPERIENCE_COUNTER: &str = "experiences";
const ERROR_COUNTER: &str = "errors";

pub struct SqliteBackend {
    /// close 后为 None
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                AgentError::StorageFailure(format!("create {}: {e}", parent.display()))
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS experiences (
                 id          INTEGER PRIMARY KEY,
                 timestamp   INTEGER NOT NULL,
                 instruction TEXT NOT NULL,
                 plan        TEXT NOT NULL,
                 run_report  TEXT NOT NULL,
                 reflection  TEXT,
                 embedding   TEXT NOT NULL,
                 hits        INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS errors (
                 id           INTEGER PRIMARY KEY,
                 timestamp    INTEGER NOT NULL,
                 instruction  TEXT NOT NULL,
                 plan         TEXT,
                 error_detail TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS counters (
                 name  TEXT PRIMARY KEY,
                 value INTEGER NOT NULL
             );",
        )?;
        // 旧库没有 hits 列
        if !Self::has_column(&conn, "experiences", "hits")? {
            conn.execute_batch(
                "ALTER TABLE experiences ADD COLUMN hits INTEGER NOT NULL DEFAULT 0",
            )?;
        }
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, AgentError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for name in names {
            if name? == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn load_hits(conn: &Connection) -> Result<HashMap<u64, u64>, AgentError> {
        let mut stmt = conn.prepare("SELECT id, hits FROM experiences WHERE hits > 0")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, hits) = row?;
            out.insert(id as u64, hits.max(0) as u64);
        }
        Ok(out)
    }

    fn lock_connection(&self) -> Result<MutexGuard<'_, Option<Connection>>, AgentError> {
        self.conn
            .lock()
            .map_err(|e| AgentError::StorageFailure(format!("Lock error: {e}")))
    }

    fn counter(conn: &Connection, name: &str) -> Result<u64, AgentError> {
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(1).max(1) as u64)
    }

    fn set_counter(conn: &Connection, name: &str, next: u64) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            params![name, next as i64],
        )
    }

    fn load_experiences(conn: &Connection) -> Result<Vec<ExperienceRecord>, AgentError> {
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, instruction, plan, run_report, reflection, embedding
             FROM experiences ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, timestamp, instruction, plan, report, reflection, embedding) = row?;
            out.push(ExperienceRecord {
                id: id as u64,
                timestamp,
                instruction: from_json(&instruction)?,
                plan: from_json(&plan)?,
                run_report: from_json(&report)?,
                reflection,
                embedding: from_json(&embedding)?,
            });
        }
        Ok(out)
    }

    fn load_errors(conn: &Connection) -> Result<Vec<ErrorRecord>, AgentError> {
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, instruction, plan, error_detail FROM errors ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, timestamp, instruction, plan, detail) = row?;
            out.push(ErrorRecord {
                id: id as u64,
                timestamp,
                instruction: from_json(&instruction)?,
                plan: plan.as_deref().map(from_json).transpose()?,
                error_detail: from_json(&detail)?,
            });
        }
        Ok(out)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, AgentError> {
    serde_json::to_string(value).map_err(|e| AgentError::StorageFailure(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, AgentError> {
    serde_json::from_str(raw)
        .map_err(|e| AgentError::StorageFailure(format!("corrupt stored record: {e}")))
}

fn closed() -> AgentError {
    AgentError::StorageFailure("experience store is closed".to_string())
}

impl ExperienceBackend for SqliteBackend {
    fn load(&self) -> Result<LoadedState, AgentError> {
        let guard = self.lock_connection()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        let experiences = Self::load_experiences(conn)?;
        let errors = Self::load_errors(conn)?;
        let hits = Self::load_hits(conn)?;
        // 计数器与现存最大 id 取较大者
        let next_experience_id = Self::counter(conn, EXPERIENCE_COUNTER)?
            .max(experiences.last().map(|r| r.id + 1).unwrap_or(1));
        let next_error_id = Self::counter(conn, ERROR_COUNTER)?
            .max(errors.last().map(|r| r.id + 1).unwrap_or(1));
        Ok(LoadedState {
            experiences,
            errors,
            next_experience_id,
            next_error_id,
            hits,
        })
    }

    fn append_experience(&self, record: &ExperienceRecord) -> Result<(), AgentError> {
        let instruction = to_json(&record.instruction)?;
        let plan = to_json(&record.plan)?;
        let report = to_json(&record.run_report)?;
        let embedding = to_json(&record.embedding)?;

        let mut guard = self.lock_connection()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO experiences (id, timestamp, instruction, plan, run_report, reflection, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id as i64,
                record.timestamp,
                instruction,
                plan,
                report,
                record.reflection,
                embedding
            ],
        )?;
        Self::set_counter(&tx, EXPERIENCE_COUNTER, record.id + 1)?;
        tx.commit()?;
        Ok(())
    }

    fn append_error(&self, record: &ErrorRecord) -> Result<(), AgentError> {
        let instruction = to_json(&record.instruction)?;
        let plan = record.plan.as_ref().map(to_json).transpose()?;
        let detail = to_json(&record.error_detail)?;

        let mut guard = self.lock_connection()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO errors (id, timestamp, instruction, plan, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.id as i64, record.timestamp, instruction, plan, detail],
        )?;
        Self::set_counter(&tx, ERROR_COUNTER, record.id + 1)?;
        tx.commit()?;
        Ok(())
    }

    fn remove_experiences(&self, ids: &[u64]) -> Result<(), AgentError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock_connection()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM experiences WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![*id as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn record_hits(&self, ids: &[u64]) -> Result<(), AgentError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock_connection()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE experiences SET hits = hits + 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![*id as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn close(&self) -> Result<(), AgentError> {
        let mut guard = self.lock_connection()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| AgentError::from(e))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
