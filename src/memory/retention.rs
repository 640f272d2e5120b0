//! 经验保留策略：按年龄、命中次数、总量上限决定哪些记录可被 prune

use std::time::Duration;

use serde::Serialize;

use crate::config::RetentionSection;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    /// 超过宽限期后命中次数仍低于该值的记录被清理
    pub min_hits: Option<u64>,
    pub min_hits_grace: Duration,
    /// 超出时从最旧的记录开始清理
    pub max_records: Option<usize>,
}

/// 单条记录被清理的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    Expired,
    LowHits,
    OverCapacity,
}

impl RetentionPolicy {
    /// 不清理任何记录
    pub fn keep_all() -> Self {
        Self::default()
    }

    pub fn from_config(section: &RetentionSection) -> Self {
        Self {
            max_age: section.max_age_secs.map(Duration::from_secs),
            min_hits: section.min_hits.filter(|n| *n > 0),
            min_hits_grace: Duration::from_secs(section.min_hits_grace_secs.unwrap_or(0)),
            max_records: section.max_records,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_min_hits(mut self, min_hits: u64, grace: Duration) -> Self {
        self.min_hits = Some(min_hits);
        self.min_hits_grace = grace;
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    /// 按年龄与命中规则判断单条记录；容量规则由调用方按整体数量处理
    pub fn evaluate(&self, timestamp_ms: i64, hits: u64, now_ms: i64) -> Option<PruneReason> {
        let age_ms = now_ms.saturating_sub(timestamp_ms).max(0) as u128;
        if let Some(max_age) = self.max_age {
            if age_ms > max_age.as_millis() {
                return Some(PruneReason::Expired);
            }
        }
        if let Some(min_hits) = self.min_hits {
            if age_ms > self.min_hits_grace.as_millis() && hits < min_hits {
                return Some(PruneReason::LowHits);
            }
        }
        None
    }
}
