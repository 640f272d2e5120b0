//! 经验记录与错误记录，以及跨记录的动作模式摘要
//!
//! 两类记录都只追加：纠正一条经验意味着写入新记录，而不是原地修改。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{ErrorInfo, RunStatus};
use crate::executor::RunReport;
use crate::plan::{ActionKind, Instruction, Plan};

/// (指令, 计划, 结果) 三元组；id 由经验库分配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    pub id: u64,
    /// epoch 毫秒
    pub timestamp: i64,
    pub instruction: Instruction,
    pub plan: Plan,
    pub run_report: RunReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    /// 指令文本的定长嵌入
    pub embedding: Vec<f32>,
}

impl ExperienceRecord {
    pub fn status(&self) -> RunStatus {
        self.run_report.status
    }

    pub fn succeeded(&self) -> bool {
        self.run_report.status == RunStatus::Succeeded
    }
}

/// 未产出可用 RunReport 的失败（规划失败等）；不进入相似度索引
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: u64,
    pub timestamp: i64,
    pub instruction: Instruction,
    /// 规划本身失败时为 None
    #[serde(default)]
    pub plan: Option<Plan>,
    pub error_detail: ErrorInfo,
}

/// 连续两步的动作组合及出现次数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionPattern {
    pub kinds: [ActionKind; 2],
    /// 包含该组合的记录数
    pub records: usize,
    /// 其中执行成功的记录数
    pub successes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub record_count: usize,
    pub success_count: usize,
    pub kind_frequencies: BTreeMap<ActionKind, usize>,
    /// 出现在至少两条记录中的动作组合，按出现次数降序
    pub patterns: Vec<ActionPattern>,
}

impl Summary {
    pub fn success_rate(&self) -> f32 {
        if self.record_count == 0 {
            0.0
        } else {
            self.success_count as f32 / self.record_count as f32
        }
    }
}

/// 提取重复的动作模式；只依赖输入，结果确定
pub fn summarize<'a>(records: impl IntoIterator<Item = &'a ExperienceRecord>) -> Summary {
    let mut summary = Summary::default();
    let mut pairs: BTreeMap<[ActionKind; 2], (usize, usize)> = BTreeMap::new();

    for record in records {
        summary.record_count += 1;
        let ok = record.succeeded();
        if ok {
            summary.success_count += 1;
        }
        for kind in record.plan.kinds() {
            *summary.kind_frequencies.entry(kind).or_insert(0) += 1;
        }
        // 同一记录内重复出现只计一次
        let seen: BTreeSet<[ActionKind; 2]> = record
            .plan
            .kinds()
            .windows(2)
            .map(|w| [w[0], w[1]])
            .collect();
        for pair in seen {
            let entry = pairs.entry(pair).or_insert((0, 0));
            entry.0 += 1;
            if ok {
                entry.1 += 1;
            }
        }
    }

    summary.patterns = pairs
        .into_iter()
        .filter(|(_, (n, _))| *n >= 2)
        .map(|(kinds, (records, successes))| ActionPattern {
            kinds,
            records,
            successes,
        })
        .collect();
    // 稳定排序：次数相同保持 BTreeMap 的键序
    summary.patterns.sort_by(|a, b| b.records.cmp(&a.records));
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ActionStep, Parameters, StepResult};

    fn record(id: u64, kinds: &[ActionKind], ok: bool) -> ExperienceRecord {
        let steps: Vec<ActionStep> = kinds
            .iter()
            .map(|k| ActionStep::new(*k, Parameters::new(), k.as_str()))
            .collect();
        let plan = Plan::new(steps.clone());
        let results = steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                if ok {
                    StepResult::succeeded(i, s, Parameters::new())
                } else {
                    StepResult::failed(i, s, &crate::core::AgentError::ActionDispatch("x".into()))
                }
            })
            .take(if ok { kinds.len() } else { 1 })
            .collect();
        let report = RunReport::finished(Instruction::new("t"), plan.clone(), results, 0, None);
        ExperienceRecord {
            id,
            timestamp: id as i64,
            instruction: Instruction::new("t"),
            plan,
            run_report: report,
            reflection: None,
            embedding: vec![],
        }
    }

    #[test]
    fn test_summarize_patterns() {
        use ActionKind::*;
        let records = vec![
            record(1, &[FindElement, TypeText], true),
            record(2, &[OpenApp, FindElement, TypeText], true),
            record(3, &[OpenApp, Click], false),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.record_count, 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.kind_frequencies[&FindElement], 2);
        assert_eq!(summary.patterns.len(), 1);
        assert_eq!(summary.patterns[0].kinds, [FindElement, TypeText]);
        assert_eq!(summary.patterns[0].successes, 2);
    }

    #[test]
    fn test_summarize_is_deterministic() {
        use ActionKind::*;
        let records = vec![
            record(1, &[OpenApp, TypeText, PressKey], true),
            record(2, &[OpenApp, TypeText, PressKey], false),
            record(3, &[TypeText, PressKey, OpenApp], true),
        ];
        assert_eq!(summarize(&records), summarize(&records));
        assert_eq!(summarize(std::iter::empty()), Summary::default());
    }
}
