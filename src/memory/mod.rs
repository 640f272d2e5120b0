//! 记忆层：经验库
//!
//! - **experience**：ExperienceRecord / ErrorRecord 与动作模式摘要
//! - **store**：ExperienceStore（追加、相似度检索、prune）
//! - **backend**：持久化后端（内存 / SQLite）
//! - **retention**：保留策略
//! - **tokenizer**：中英文分词，供嵌入使用

pub mod backend;
pub mod experience;
pub mod retention;
pub mod store;
pub mod tokenizer;

pub use backend::{ExperienceBackend, InMemoryBackend, LoadedState, SqliteBackend};
pub use experience::{summarize, ActionPattern, ErrorRecord, ExperienceRecord, Summary};
pub use retention::{PruneReason, RetentionPolicy};
pub use store::{ExperienceStore, PruneReport};
pub use tokenizer::{contains_cjk, tokenize};
