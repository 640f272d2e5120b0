//! 计划数据模型：Instruction、ActionKind、ActionStep、Plan、StepResult
//!
//! Plan 由 Planner 一次性产出，之后不可修改；重新规划会得到新的 Plan。

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{AgentError, ErrorInfo};

/// 步骤参数：字符串键到 JSON 值
pub type Parameters = Map<String, Value>;

/// 任务指令：文本 + 可选结构化上下文，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<InstructionContext>,
}

/// 指令上下文：目标应用提示、语言区域
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructionContext {
    pub app_hint: Option<String>,
    pub locale: Option<String>,
}

impl Instruction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: InstructionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn app_hint(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.app_hint.as_deref())
    }

    /// 归一化文本：小写、合并空白，用于经验复用时的精确匹配
    pub fn normalized(&self) -> String {
        normalize_text(&self.text)
    }
}

impl From<&str> for Instruction {
    fn from(text: &str) -> Self {
        Instruction::new(text)
    }
}

impl From<String> for Instruction {
    fn from(text: String) -> Self {
        Instruction::new(text)
    }
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 已知动作类型（封闭集合）；Generic 表示「规划器不知道怎么做」的兜底步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    TypeText,
    PressKey,
    OpenApp,
    Scroll,
    Wait,
    FindElement,
    Generic,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Click,
        ActionKind::TypeText,
        ActionKind::PressKey,
        ActionKind::OpenApp,
        ActionKind::Scroll,
        ActionKind::Wait,
        ActionKind::FindElement,
        ActionKind::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::TypeText => "type_text",
            ActionKind::PressKey => "press_key",
            ActionKind::OpenApp => "open_app",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::FindElement => "find_element",
            ActionKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| AgentError::Validation(format!("unknown action kind: {s}")))
    }
}

/// 单个动作步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub kind: ActionKind,
    #[serde(default)]
    pub parameters: Parameters,
    pub description: String,
}

impl ActionStep {
    pub fn new(kind: ActionKind, parameters: Parameters, description: impl Into<String>) -> Self {
        Self {
            kind,
            parameters,
            description: description.into(),
        }
    }

    /// 兜底步骤：标记为 unhandled，区分「不知道怎么做」与「无事可做」
    pub fn generic(instruction: &str) -> Self {
        let summary: String = instruction.trim().chars().take(60).collect();
        let mut parameters = Parameters::new();
        parameters.insert("instruction_summary".into(), Value::String(summary));
        parameters.insert("unhandled".into(), Value::Bool(true));
        Self::new(
            ActionKind::Generic,
            parameters,
            "Default step for unknown instruction",
        )
    }

    pub fn is_unhandled(&self) -> bool {
        self.kind == ActionKind::Generic
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// 有序步骤序列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    steps: Vec<ActionStep>,
}

impl Plan {
    pub fn new(steps: Vec<ActionStep>) -> Self {
        Self { steps }
    }

    /// 规划失败时报告里使用的空计划
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ActionStep> {
        self.steps.iter()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.steps.iter().map(|s| s.kind).collect()
    }

    /// 是否只有兜底步骤
    pub fn is_fallback(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(ActionStep::is_unhandled)
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a ActionStep;
    type IntoIter = std::slice::Iter<'a, ActionStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

/// 单步执行结果；每个已执行步骤恰好一条，按执行顺序排列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// 在计划中的位置（从 0 开始）
    pub index: usize,
    pub step: ActionStep,
    pub success: bool,
    #[serde(default)]
    pub detail: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// 含补救在内的尝试次数
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl StepResult {
    pub fn succeeded(index: usize, step: ActionStep, detail: Parameters) -> Self {
        Self {
            index,
            step,
            success: true,
            detail,
            error: None,
            attempts: 1,
        }
    }

    pub fn failed(index: usize, step: ActionStep, error: &AgentError) -> Self {
        let mut detail = Parameters::new();
        detail.insert("error".into(), Value::String(error.to_string()));
        detail.insert("parameters".into(), Value::Object(step.parameters.clone()));
        Self {
            index,
            step,
            success: false,
            detail,
            error: Some(error.to_info()),
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}
