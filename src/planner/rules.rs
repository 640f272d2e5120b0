//! 规则 oracle：关键词 / 正则驱动的离线规划
//!
//! 指令先按连接词（and / then / 逗号 / 然后）切成子句，每个子句按顺序匹配规则并产出步骤：
//! - open … file → find_element(File Explorer) + open_app(Explorer)
//! - open <app> → open_app（经过别名表，如 text editor → TextEditor）
//! - type <text> → find_element(textfield) + type_text
//! - press <key> / scroll <dir> [n] / wait [n seconds] / click <target>
//!
//! 没有子句命中时返回空建议，由 Planner 决定复用经验或兜底。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{json, Value};

use crate::plan::{CandidateStep, Instruction, Parameters};
use crate::planner::oracle::{OracleError, PlanningContext, PlanningOracle};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClauseKind {
    Open,
    Type,
    Press,
    Scroll,
    Wait,
    Click,
}

struct Rule {
    kind: ClauseKind,
    re: Regex,
}

const RULE_PATTERNS: &[(ClauseKind, &str)] = &[
    (
        ClauseKind::Open,
        r"(?i)^(?:please\s+)?(?:open|launch|start|run)\s+(?:up\s+)?(?:the\s+|a\s+|an\s+|my\s+)?(?P<target>.+)$",
    ),
    (ClauseKind::Open, r"^(?:打开|启动)\s*(?P<target>.+)$"),
    (
        ClauseKind::Type,
        r#"(?i)^(?:please\s+)?(?:type|write|enter)\s+(?P<text>.+?)(?:\s+(?:into|in)\s+(?:the\s+)?[\w\s]+)?$"#,
    ),
    (ClauseKind::Type, r"^输入\s*(?P<text>.+)$"),
    (
        ClauseKind::Press,
        r"(?i)^(?:please\s+)?(?:press|hit)\s+(?:the\s+)?(?P<key>.+?)(?:\s+key)?$",
    ),
    (
        ClauseKind::Scroll,
        r"(?i)^(?:please\s+)?scroll\s+(?P<dir>up|down|left|right)(?:\s+(?:by\s+)?(?P<amount>\d+))?",
    ),
    (
        ClauseKind::Wait,
        r"(?i)^(?:please\s+)?(?:wait|pause|sleep)(?:\s+(?:for\s+)?(?P<secs>\d+(?:\.\d+)?)\s*(?:s|secs?|seconds?)?)?$",
    ),
    (
        ClauseKind::Click,
        r"(?i)^(?:please\s+)?(?:click|tap)\s+(?:on\s+)?(?:the\s+)?(?P<target>.+?)(?:\s+button)?$",
    ),
];

const CLAUSE_SEPARATOR: &str = r"(?i)\s*(?:[,;，；]|\band then\b|\bthen\b|\band\b|然后|并且)\s*";

/// 应用别名（小写）→ 规范名
const APP_ALIASES: &[(&str, &str)] = &[
    ("text editor", "TextEditor"),
    ("texteditor", "TextEditor"),
    ("editor", "TextEditor"),
    ("notepad", "Notepad"),
    ("记事本", "Notepad"),
    ("browser", "Browser"),
    ("web browser", "Browser"),
    ("chrome", "Browser"),
    ("firefox", "Browser"),
    ("浏览器", "Browser"),
    ("terminal", "Terminal"),
    ("console", "Terminal"),
    ("shell", "Terminal"),
    ("终端", "Terminal"),
    ("calculator", "Calculator"),
    ("calc", "Calculator"),
    ("计算器", "Calculator"),
    ("explorer", "Explorer"),
    ("file explorer", "Explorer"),
];

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("invalid planning rule {}: {}", pattern, e);
            None
        }
    }
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        RULE_PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| compile(pattern).map(|re| Rule { kind: *kind, re }))
            .collect()
    })
}

fn split_clauses(text: &str) -> Vec<String> {
    static SEPARATOR: OnceLock<Option<Regex>> = OnceLock::new();
    let clauses: Vec<String> = match SEPARATOR.get_or_init(|| compile(CLAUSE_SEPARATOR)) {
        Some(re) => re.split(text).map(|c| c.trim().to_string()).collect(),
        None => vec![text.trim().to_string()],
    };
    clauses.into_iter().filter(|c| !c.is_empty()).collect()
}

fn strip_quotes(text: &str) -> &str {
    text.trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’' | '「' | '」'))
}

/// 别名表解析应用名；未知应用保留原文
pub fn canonical_app_name(target: &str) -> String {
    let mut key = strip_quotes(target).trim().to_lowercase();
    for suffix in [" application", " app", " window", " program"] {
        if let Some(stripped) = key.strip_suffix(suffix) {
            key = stripped.trim().to_string();
        }
    }
    APP_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| strip_quotes(target).trim().to_string())
}

fn params(value: Value) -> Parameters {
    match value {
        Value::Object(map) => map,
        _ => Parameters::new(),
    }
}

fn capture<'t>(caps: &Captures<'t>, name: &str) -> Option<&'t str> {
    caps.name(name).map(|m| m.as_str().trim()).filter(|s| !s.is_empty())
}

fn steps_for_clause(kind: ClauseKind, caps: &Captures<'_>) -> Vec<CandidateStep> {
    match kind {
        ClauseKind::Open => {
            let Some(target) = capture(caps, "target") else {
                return Vec::new();
            };
            if target.to_lowercase().contains("file") {
                return vec![
                    CandidateStep::new(
                        "find_element",
                        params(json!({"name": "File Explorer"})),
                        "Find File Explorer",
                    ),
                    CandidateStep::new(
                        "open_app",
                        params(json!({"app_name": "Explorer"})),
                        "Open File Explorer",
                    ),
                ];
            }
            let app = canonical_app_name(target);
            vec![CandidateStep::new(
                "open_app",
                params(json!({"app_name": app})),
                format!("Open {app}"),
            )]
        }
        ClauseKind::Type => {
            let Some(text) = capture(caps, "text") else {
                return Vec::new();
            };
            let text = strip_quotes(text).to_string();
            vec![
                CandidateStep::new(
                    "find_element",
                    params(json!({"type": "textfield"})),
                    "Find text input area",
                ),
                CandidateStep::new(
                    "type_text",
                    params(json!({"text": text})),
                    format!("Type '{text}'"),
                ),
            ]
        }
        ClauseKind::Press => capture(caps, "key")
            .map(|key| {
                let key = key.to_lowercase();
                vec![CandidateStep::new(
                    "press_key",
                    params(json!({"key_name": key})),
                    format!("Press {key}"),
                )]
            })
            .unwrap_or_default(),
        ClauseKind::Scroll => {
            let direction = capture(caps, "dir").unwrap_or("down").to_lowercase();
            let amount: i64 = capture(caps, "amount")
                .and_then(|a| a.parse().ok())
                .unwrap_or(100);
            vec![CandidateStep::new(
                "scroll",
                params(json!({"direction": direction, "amount": amount})),
                format!("Scroll {direction}"),
            )]
        }
        ClauseKind::Wait => {
            let secs: f64 = capture(caps, "secs")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0);
            vec![CandidateStep::new(
                "wait",
                params(json!({"duration_s": secs})),
                format!("Wait {secs} s"),
            )]
        }
        ClauseKind::Click => {
            let Some(target) = capture(caps, "target") else {
                return Vec::new();
            };
            let target = strip_quotes(target).to_string();
            vec![
                CandidateStep::new(
                    "find_element",
                    params(json!({"name": target})),
                    format!("Find {target}"),
                ),
                CandidateStep::new(
                    "click",
                    params(json!({"target": target})),
                    format!("Click {target}"),
                ),
            ]
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RuleOracle;

impl RuleOracle {
    pub fn new() -> Self {
        Self
    }

    /// 同步规划（规则匹配不涉及 I/O）
    pub fn plan_text(&self, instruction: &Instruction) -> Vec<CandidateStep> {
        let mut steps = Vec::new();
        for clause in split_clauses(&instruction.text) {
            let matched = rules()
                .iter()
                .find_map(|rule| rule.re.captures(&clause).map(|caps| (rule.kind, caps)));
            match matched {
                Some((kind, caps)) => steps.extend(steps_for_clause(kind, &caps)),
                None => tracing::debug!(clause = %clause, "no planning rule matched"),
            }
        }

        // 只有输入没有打开动作时，按上下文提示先打开目标应用
        let opens_app = steps.iter().any(|s| s.action == "open_app");
        let types = steps.iter().any(|s| s.action == "type_text");
        if types && !opens_app {
            if let Some(hint) = instruction.app_hint() {
                let app = canonical_app_name(hint);
                steps.insert(
                    0,
                    CandidateStep::new(
                        "open_app",
                        params(json!({"app_name": app})),
                        format!("Open {app}"),
                    ),
                );
            }
        }
        steps
    }
}

#[async_trait]
impl PlanningOracle for RuleOracle {
    fn name(&self) -> &str {
        "rules"
    }

    async fn generate(
        &self,
        instruction: &Instruction,
        _context: &PlanningContext<'_>,
    ) -> Result<Vec<CandidateStep>, OracleError> {
        Ok(self.plan_text(instruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::InstructionContext;

    fn actions(text: &str) -> Vec<String> {
        RuleOracle::new()
            .plan_text(&Instruction::new(text))
            .into_iter()
            .map(|s| s.action)
            .collect()
    }

    #[test]
    fn test_open_editor_and_type() {
        let steps = RuleOracle::new().plan_text(&Instruction::new("open a text editor and type hello"));
        let names: Vec<&str> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(names, vec!["open_app", "find_element", "type_text"]);
        assert_eq!(steps[0].params["app_name"], "TextEditor");
        assert_eq!(steps[2].params["text"], "hello");
    }

    #[test]
    fn test_open_file() {
        assert_eq!(actions("Open a file"), vec!["find_element", "open_app"]);
    }

    #[test]
    fn test_unknown_instruction_gives_empty_suggestion() {
        assert!(actions("juggle the windows gracefully").is_empty());
        assert!(actions("").is_empty());
    }

    #[test]
    fn test_press_scroll_wait_click() {
        assert_eq!(
            actions("press the Enter key, then scroll down 300; wait 2 seconds and click OK"),
            vec!["press_key", "scroll", "wait", "find_element", "click"]
        );
        let steps = RuleOracle::new().plan_text(&Instruction::new("scroll up by 50"));
        assert_eq!(steps[0].params["amount"], 50);
        assert_eq!(steps[0].params["direction"], "up");
    }

    #[test]
    fn test_quoted_text_and_target_suffix() {
        let steps = RuleOracle::new().plan_text(&Instruction::new("type 'Dear team' into the editor"));
        assert_eq!(steps[1].params["text"], "Dear team");
    }

    #[test]
    fn test_app_hint_prepends_open() {
        let instruction = Instruction::new("type hello").with_context(InstructionContext {
            app_hint: Some("notepad".into()),
            locale: None,
        });
        let steps = RuleOracle::new().plan_text(&instruction);
        assert_eq!(steps[0].action, "open_app");
        assert_eq!(steps[0].params["app_name"], "Notepad");
    }

    #[test]
    fn test_chinese_clauses() {
        assert_eq!(
            actions("打开记事本然后输入你好"),
            vec!["open_app", "find_element", "type_text"]
        );
    }

    #[test]
    fn test_unknown_app_kept_verbatim() {
        assert_eq!(canonical_app_name("Photoshop"), "Photoshop");
        assert_eq!(canonical_app_name("the calculator app"), "the calculator app");
        assert_eq!(canonical_app_name("calculator app"), "Calculator");
    }
}
