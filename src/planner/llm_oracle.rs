//! LLM oracle：让语言模型把指令翻译为步骤序列
//!
//! 期望回复中含 JSON：`{"plan": [{"action": "...", "params": {...}, "description": "..."}]}`
//! （也接受裸数组）。调用失败 → Unavailable；回复中找不到可解析的 JSON → MalformedOutput。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{LlmClient, Message};
use crate::plan::{CandidateStep, Instruction};
use crate::planner::oracle::{OracleError, PlanningContext, PlanningOracle};

/// 提示里最多列出几条历史经验
const MAX_PROMPT_EXPERIENCES: usize = 3;
const MAX_PROMPT_ELEMENTS: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanPayload {
    Wrapped { plan: Vec<CandidateStep> },
    Bare(Vec<CandidateStep>),
}

/// 从回复中提取 JSON 片段：```json 代码块优先，其次最外层 {...} 或 [...]
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let object = trimmed.find('{').zip(trimmed.rfind('}'));
    let array = trimmed.find('[').zip(trimmed.rfind(']'));
    let (start, end) = match (object, array) {
        (Some(o), Some(a)) => {
            if a.0 < o.0 {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    (start < end).then(|| &trimmed[start..=end])
}

pub fn parse_plan_output(output: &str) -> Result<Vec<CandidateStep>, OracleError> {
    let json = extract_json(output).ok_or_else(|| {
        let preview: String = output.chars().take(120).collect();
        OracleError::MalformedOutput(format!("no JSON plan in reply: {preview}"))
    })?;
    let payload: PlanPayload = serde_json::from_str(json)
        .map_err(|e| OracleError::MalformedOutput(format!("{e}: {json}")))?;
    Ok(match payload {
        PlanPayload::Wrapped { plan } => plan,
        PlanPayload::Bare(steps) => steps,
    })
}

pub struct LlmOracle {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmOracle {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: default_system_prompt(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build_user_prompt(instruction: &Instruction, context: &PlanningContext<'_>) -> String {
        let mut prompt = format!("Instruction: {}\n", instruction.text);
        if let Some(hint) = instruction.app_hint() {
            prompt.push_str(&format!("Target application: {hint}\n"));
        }

        let kinds: Vec<&str> = context.enabled_kinds.iter().map(|k| k.as_str()).collect();
        prompt.push_str(&format!("Allowed actions: {}\n", kinds.join(", ")));

        if !context.experiences.is_empty() {
            prompt.push_str("\nRelevant past experiences:\n");
            for exp in context.experiences.iter().take(MAX_PROMPT_EXPERIENCES) {
                let kinds: Vec<&str> = exp.plan.iter().map(|s| s.kind.as_str()).collect();
                prompt.push_str(&format!(
                    "- \"{}\" → [{}] ({})\n",
                    exp.instruction.text,
                    kinds.join(", "),
                    exp.status()
                ));
            }
        }

        if let Some(snapshot) = context.snapshot {
            prompt.push_str(&format!("\nCurrent screen: {}\n", snapshot.description));
            for el in snapshot.elements.iter().take(MAX_PROMPT_ELEMENTS) {
                prompt.push_str(&format!("- {} '{}' (id={})\n", el.element_type, el.name, el.id));
            }
        }
        prompt
    }
}

fn default_system_prompt() -> String {
    r#"You translate desktop automation instructions into a plan of GUI actions.
Reply with JSON only: {"plan": [{"action": "<action>", "params": {...}, "description": "<short label>"}]}
Required params: type_text.text, press_key.key_name, open_app.app_name, click needs x+y or element_id/target,
scroll.direction (up/down/left/right), wait.duration_s (seconds), find_element needs name or type.
If you do not know how to perform the instruction, reply {"plan": []}."#
        .to_string()
}

#[async_trait]
impl PlanningOracle for LlmOracle {
    fn name(&self) -> &str {
        "llm"
    }

    async fn generate(
        &self,
        instruction: &Instruction,
        context: &PlanningContext<'_>,
    ) -> Result<Vec<CandidateStep>, OracleError> {
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(Self::build_user_prompt(instruction, context)),
        ];
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(OracleError::Unavailable)?;
        let steps = parse_plan_output(&reply)?;
        tracing::debug!(steps = steps.len(), "llm oracle proposed plan");
        Ok(steps)
    }
}
