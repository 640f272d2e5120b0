//! 模拟输入驱动：在 SimulatedDesktop 上执行动作
//!
//! - open_app 只认 known_apps（忽略大小写），否则 "application not found"
//! - wait 真实等待，但不超过 max_wait
//! - 成功后等待 settle_delay 让 UI 刷新

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::action::ActionDispatcher;
use crate::config::ActionSection;
use crate::perception::{EnvironmentSnapshot, SimulatedDesktop};
use crate::plan::{ActionKind, Parameters};

fn str_param<'a>(params: &'a Parameters, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or_default()
}

pub struct SimulatedAction {
    desktop: Arc<SimulatedDesktop>,
    known_apps: Vec<String>,
    settle_delay: Duration,
    max_wait: Duration,
}

impl SimulatedAction {
    pub fn new(desktop: Arc<SimulatedDesktop>, config: &ActionSection) -> Self {
        Self {
            desktop,
            known_apps: config.known_apps.clone(),
            settle_delay: Duration::from_millis(config.default_delay_ms),
            max_wait: Duration::try_from_secs_f64(config.max_wait_secs.max(0.0))
                .unwrap_or(Duration::ZERO),
        }
    }

    fn resolve_app(&self, requested: &str) -> Option<&str> {
        let wanted = requested.trim().to_lowercase();
        self.known_apps
            .iter()
            .find(|app| app.to_lowercase() == wanted)
            .map(String::as_str)
    }

    fn click(&self, params: &Parameters, snapshot: &EnvironmentSnapshot) -> Result<String, String> {
        if let (Some(x), Some(y)) = (
            params.get("x").and_then(Value::as_i64),
            params.get("y").and_then(Value::as_i64),
        ) {
            return Ok(format!("clicked at ({x}, {y})"));
        }
        let target = params
            .get("element_id")
            .or_else(|| params.get("target"))
            .and_then(Value::as_str)
            .ok_or_else(|| "click needs x/y or element_id".to_string())?;
        let mut query = Parameters::new();
        let key = if params.contains_key("element_id") { "id" } else { "name" };
        query.insert(key.into(), Value::String(target.to_string()));
        let element = snapshot
            .elements
            .iter()
            .find(|e| e.matches(&query))
            .ok_or_else(|| format!("click target not on screen: {target}"))?;
        let (x, y) = element.center();
        Ok(format!("clicked {} at ({x}, {y})", element.name))
    }

    async fn dispatch(
        &self,
        kind: ActionKind,
        params: &Parameters,
        snapshot: &EnvironmentSnapshot,
    ) -> Result<String, String> {
        match kind {
            ActionKind::Click => self.click(params, snapshot),
            ActionKind::TypeText => {
                let text = str_param(params, "text");
                let window = self
                    .desktop
                    .type_text(text)
                    .ok_or_else(|| "no focused window to type into".to_string())?;
                Ok(format!("typed {} chars into {window}", text.chars().count()))
            }
            ActionKind::PressKey => {
                let key = str_param(params, "key_name");
                self.desktop.press_key(key);
                Ok(format!("pressed {key}"))
            }
            ActionKind::OpenApp => {
                let requested = str_param(params, "app_name");
                let app = self
                    .resolve_app(requested)
                    .ok_or_else(|| format!("application not found: {requested}"))?;
                self.desktop.open_window(app);
                Ok(format!("application '{app}' opened"))
            }
            ActionKind::Scroll => {
                let direction = params.get("direction").and_then(Value::as_str).unwrap_or("down");
                let amount = params.get("amount").and_then(Value::as_i64).unwrap_or(100);
                let delta = match direction {
                    "up" | "left" => amount.saturating_neg(),
                    _ => amount,
                };
                let offset = self.desktop.scroll(delta);
                Ok(format!("scrolled {direction} by {amount} (offset {offset})"))
            }
            ActionKind::Wait => {
                let requested = params.get("duration_s").and_then(Value::as_f64).unwrap_or(1.0);
                // 超出 Duration 表示范围的值直接按上限处理
                let wait = Duration::try_from_secs_f64(requested.max(0.0))
                    .unwrap_or(self.max_wait)
                    .min(self.max_wait);
                tokio::time::sleep(wait).await;
                Ok(format!("waited {} ms", wait.as_millis()))
            }
            ActionKind::FindElement => {
                Err("find_element is resolved by perception, not dispatched".to_string())
            }
            ActionKind::Generic => Err(format!(
                "no handler for unrecognized instruction: {}",
                str_param(params, "instruction_summary")
            )),
        }
    }
}

#[async_trait]
impl ActionDispatcher for SimulatedAction {
    async fn perform(
        &self,
        kind: ActionKind,
        parameters: &Parameters,
        snapshot: &EnvironmentSnapshot,
    ) -> Result<Parameters, String> {
        let message = self.dispatch(kind, parameters, snapshot).await?;
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        let detail = json!({
            "action_type": kind.as_str(),
            "parameters": Value::Object(parameters.clone()),
            "message": message,
        });
        Ok(detail.as_object().cloned().unwrap_or_default())
    }
}
