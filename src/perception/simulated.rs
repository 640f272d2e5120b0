//! 模拟桌面
//!
//! SimulatedDesktop 是 SimulatedPerception 与 SimulatedAction 共享的状态：
//! 打开应用会获得焦点并出现该应用的输入框与按钮，输入文本写入焦点窗口的缓冲区。

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::perception::{ElementHandle, EnvironmentSnapshot, Perception};
use crate::plan::Parameters;

#[derive(Debug, Default)]
struct DesktopState {
    /// 打开的窗口及其已输入文本，按打开顺序
    windows: Vec<(String, String)>,
    focused: Option<String>,
    last_key: Option<String>,
    scroll_offset: i64,
}

#[derive(Debug, Default)]
pub struct SimulatedDesktop {
    state: RwLock<DesktopState>,
}

fn shell_elements() -> Vec<ElementHandle> {
    vec![
        ElementHandle::new("start", "button", "Start", [0, 1040, 48, 40]),
        ElementHandle::new("taskbar-explorer", "taskbar_item", "File Explorer", [56, 1040, 48, 40]),
        ElementHandle::new("taskbar-browser", "taskbar_item", "Browser", [112, 1040, 48, 40]),
    ]
}

fn window_elements(app: &str) -> Vec<ElementHandle> {
    let slug = app.to_lowercase().replace(' ', "-");
    vec![
        ElementHandle::new(&format!("{slug}-input"), "textfield", &format!("{app} input"), [100, 150, 800, 600]),
        ElementHandle::new(&format!("{slug}-ok"), "button", "OK", [820, 760, 80, 30]),
    ]
}

impl SimulatedDesktop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // 锁中毒时沿用内部状态并告警
    fn read(&self) -> std::sync::RwLockReadGuard<'_, DesktopState> {
        self.state.read().unwrap_or_else(|e| {
            tracing::warn!("simulated desktop lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DesktopState> {
        self.state.write().unwrap_or_else(|e| {
            tracing::warn!("simulated desktop lock poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn elements(&self) -> Vec<ElementHandle> {
        let state = self.read();
        let mut elements = shell_elements();
        if let Some(focused) = &state.focused {
            elements.extend(window_elements(focused));
        }
        elements
    }

    pub fn snapshot(&self) -> EnvironmentSnapshot {
        let elements = self.elements();
        let state = self.read();
        EnvironmentSnapshot {
            timestamp: chrono::Utc::now().timestamp_millis(),
            platform: std::env::consts::OS.to_string(),
            description: format!(
                "{} window(s) open, focus: {}",
                state.windows.len(),
                state.focused.as_deref().unwrap_or("desktop")
            ),
            focused_window: state.focused.clone(),
            screen_resolution: (1920, 1080),
            elements,
        }
    }

    pub fn find(&self, properties: &Parameters) -> Option<ElementHandle> {
        self.elements().into_iter().find(|e| e.matches(properties))
    }

    /// 打开（或切换到）应用窗口并获得焦点
    pub fn open_window(&self, app: &str) {
        let mut state = self.write();
        if !state.windows.iter().any(|(name, _)| name == app) {
            state.windows.push((app.to_string(), String::new()));
        }
        state.focused = Some(app.to_string());
    }

    /// 向焦点窗口输入文本；无焦点窗口时返回 None
    pub fn type_text(&self, text: &str) -> Option<String> {
        let mut state = self.write();
        let focused = state.focused.clone()?;
        let buffer = state
            .windows
            .iter_mut()
            .find(|(name, _)| *name == focused)
            .map(|(_, buf)| buf)?;
        buffer.push_str(text);
        Some(focused)
    }

    pub fn press_key(&self, key: &str) {
        self.write().last_key = Some(key.to_string());
    }

    pub fn scroll(&self, delta: i64) -> i64 {
        let mut state = self.write();
        state.scroll_offset = state.scroll_offset.saturating_add(delta);
        state.scroll_offset
    }

    pub fn focused_window(&self) -> Option<String> {
        self.read().focused.clone()
    }

    /// 各窗口已输入的文本
    pub fn typed_text(&self) -> BTreeMap<String, String> {
        self.read().windows.iter().cloned().collect()
    }

    pub fn last_key(&self) -> Option<String> {
        self.read().last_key.clone()
    }
}

/// 基于模拟桌面的感知实现；latency 用于模拟采集耗时
pub struct SimulatedPerception {
    desktop: Arc<SimulatedDesktop>,
    latency: Duration,
}

impl SimulatedPerception {
    pub fn new(desktop: Arc<SimulatedDesktop>) -> Self {
        Self {
            desktop,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn settle(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Perception for SimulatedPerception {
    async fn get_current_state(&self) -> Result<EnvironmentSnapshot, String> {
        self.settle().await;
        Ok(self.desktop.snapshot())
    }

    async fn find_element(&self, properties: &Parameters) -> Result<Option<ElementHandle>, String> {
        self.settle().await;
        let found = self.desktop.find(properties);
        tracing::debug!(
            properties = %serde_json::Value::Object(properties.clone()),
            found = found.is_some(),
            "find_element"
        );
        Ok(found)
    }
}
