//! 已知动作类型注册表
//!
//! Oracle 给出的候选步骤（动作名为字符串）在这里一次性解析为 ActionKind 并校验必需参数；
//! 之后的派发只匹配枚举，不再比较字符串。未知类型或缺参数返回 Validation 错误。

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::plan::{ActionKind, ActionStep, Parameters};

/// Oracle 输出的候选步骤（未校验）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateStep {
    pub action: String,
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub description: Option<String>,
}

impl CandidateStep {
    pub fn new(action: impl Into<String>, params: Parameters, description: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params,
            description: Some(description.into()),
        }
    }
}

/// 已知动作类型 + 别名；可按配置禁用部分类型
#[derive(Debug, Clone)]
pub struct KindRegistry {
    enabled: BTreeSet<ActionKind>,
    aliases: HashMap<String, ActionKind>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KindRegistry {
    pub fn new() -> Self {
        let mut aliases = HashMap::new();
        for kind in ActionKind::ALL {
            aliases.insert(kind.as_str().to_string(), kind);
        }
        for (alias, kind) in [
            ("type", ActionKind::TypeText),
            ("typewrite", ActionKind::TypeText),
            ("press", ActionKind::PressKey),
            ("key", ActionKind::PressKey),
            ("open", ActionKind::OpenApp),
            ("open_application", ActionKind::OpenApp),
            ("launch", ActionKind::OpenApp),
            ("sleep", ActionKind::Wait),
            ("find", ActionKind::FindElement),
            ("locate", ActionKind::FindElement),
            ("generic_task_step", ActionKind::Generic),
        ] {
            aliases.insert(alias.to_string(), kind);
        }
        Self {
            enabled: ActionKind::ALL.into_iter().collect(),
            aliases,
        }
    }

    /// 按配置名禁用类型；未知名称返回 ConfigError
    pub fn with_disabled<S: AsRef<str>>(mut self, names: &[S]) -> Result<Self, AgentError> {
        for name in names {
            let kind = self
                .aliases
                .get(&name.as_ref().trim().to_lowercase())
                .copied()
                .ok_or_else(|| {
                    AgentError::ConfigError(format!("unknown action kind in config: {}", name.as_ref()))
                })?;
            self.enabled.remove(&kind);
        }
        Ok(self)
    }

    pub fn is_enabled(&self, kind: ActionKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn enabled_kinds(&self) -> Vec<ActionKind> {
        self.enabled.iter().copied().collect()
    }

    /// 解析动作名（大小写、连字符、空格不敏感）
    pub fn resolve(&self, name: &str) -> Result<ActionKind, AgentError> {
        let key = name.trim().to_lowercase().replace(['-', ' '], "_");
        let kind = self
            .aliases
            .get(&key)
            .copied()
            .ok_or_else(|| AgentError::Validation(format!("unknown action kind: {name}")))?;
        if !self.is_enabled(kind) {
            return Err(AgentError::Validation(format!("action kind disabled: {kind}")));
        }
        Ok(kind)
    }

    /// 校验候选步骤并转换为 ActionStep
    pub fn validate(&self, candidate: CandidateStep) -> Result<ActionStep, AgentError> {
        let kind = self.resolve(&candidate.action)?;
        check_parameters(kind, &candidate.params)?;
        let description = candidate
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| kind.as_str().replace('_', " "));
        Ok(ActionStep::new(kind, candidate.params, description))
    }
}

fn has_str(params: &Parameters, key: &str) -> bool {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

fn has_number(params: &Parameters, key: &str) -> bool {
    params.get(key).map(Value::is_number).unwrap_or(false)
}

fn check_parameters(kind: ActionKind, params: &Parameters) -> Result<(), AgentError> {
    let missing = |field: &str| {
        Err(AgentError::Validation(format!(
            "{kind} step is missing required parameter '{field}'"
        )))
    };
    match kind {
        ActionKind::TypeText if !params.get("text").map(Value::is_string).unwrap_or(false) => {
            missing("text")
        }
        ActionKind::PressKey if !has_str(params, "key_name") => missing("key_name"),
        ActionKind::OpenApp if !has_str(params, "app_name") => missing("app_name"),
        ActionKind::Click => {
            let by_coords = has_number(params, "x") && has_number(params, "y");
            let by_element = has_str(params, "element_id") || has_str(params, "target");
            if by_coords || by_element {
                Ok(())
            } else {
                missing("x/y or element_id")
            }
        }
        ActionKind::Scroll => match params.get("direction").and_then(Value::as_str) {
            None | Some("up") | Some("down") | Some("left") | Some("right") => Ok(()),
            Some(other) => Err(AgentError::Validation(format!(
                "scroll direction must be up/down/left/right, got '{other}'"
            ))),
        },
        ActionKind::Wait => match params.get("duration_s") {
            None => Ok(()),
            Some(v) if v.as_f64().map(|d| d.is_finite() && d >= 0.0).unwrap_or(false) => Ok(()),
            Some(_) => Err(AgentError::Validation(
                "wait duration_s must be a finite non-negative number".to_string(),
            )),
        },
        ActionKind::FindElement if params.is_empty() => missing("element properties"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Parameters {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_resolve_aliases() {
        let registry = KindRegistry::new();
        assert_eq!(registry.resolve("type").unwrap(), ActionKind::TypeText);
        assert_eq!(registry.resolve("Open-App").unwrap(), ActionKind::OpenApp);
        assert_eq!(registry.resolve("generic_task_step").unwrap(), ActionKind::Generic);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let registry = KindRegistry::new();
        let err = registry
            .validate(CandidateStep::new("fly_to_moon", params(json!({"speed": "warp9"})), "fly"))
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let registry = KindRegistry::new();
        let err = registry
            .validate(CandidateStep::new("type_text", Parameters::new(), "type"))
            .unwrap_err();
        assert!(err.to_string().contains("text"));
        assert!(registry
            .validate(CandidateStep::new("click", params(json!({"x": 10})), "click"))
            .is_err());
        assert!(registry
            .validate(CandidateStep::new("click", params(json!({"x": 10, "y": 20})), "click"))
            .is_ok());
    }

    #[test]
    fn test_wait_duration_checked() {
        let registry = KindRegistry::new();
        let wait = |v: Value| registry.validate(CandidateStep::new("wait", params(v), "wait"));
        assert!(wait(json!({"duration_s": 1e20})).is_ok());
        assert!(wait(json!({"duration_s": -1})).is_err());
        assert!(wait(json!({"duration_s": "soon"})).is_err());
    }

    #[test]
    fn test_disabled_kind() {
        let registry = KindRegistry::new().with_disabled(&["scroll"]).unwrap();
        assert!(!registry.is_enabled(ActionKind::Scroll));
        assert!(registry.resolve("scroll").is_err());
        assert!(KindRegistry::new().with_disabled(&["teleport"]).is_err());
    }

    #[test]
    fn test_default_description() {
        let registry = KindRegistry::new();
        let candidate = CandidateStep {
            action: "press_key".into(),
            params: params(json!({"key_name": "enter"})),
            description: None,
        };
        let step = registry.validate(candidate).unwrap();
        assert_eq!(step.description, "press key");
    }
}
