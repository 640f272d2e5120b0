//! 感知协作方：环境快照与元素查找
//!
//! 真实的截屏 / OCR / 无障碍接口不在本 crate 内；这里只定义接口，并提供一个模拟桌面供 CLI 与测试使用。

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plan::Parameters;

pub use simulated::{SimulatedDesktop, SimulatedPerception};

/// 可定位的 UI 元素
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub id: String,
    /// button / textfield / taskbar_item ...
    #[serde(rename = "type")]
    pub element_type: String,
    pub name: String,
    /// [x, y, width, height]
    pub bounds: [i32; 4],
}

impl ElementHandle {
    pub fn new(id: &str, element_type: &str, name: &str, bounds: [i32; 4]) -> Self {
        Self {
            id: id.to_string(),
            element_type: element_type.to_string(),
            name: name.to_string(),
            bounds,
        }
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.bounds[0] + self.bounds[2] / 2,
            self.bounds[1] + self.bounds[3] / 2,
        )
    }

    /// 属性匹配：id 精确匹配，type 忽略大小写，name 忽略大小写的子串匹配；未知属性忽略
    pub fn matches(&self, properties: &Parameters) -> bool {
        let mut constrained = false;
        for (key, value) in properties {
            let Some(want) = value.as_str().map(str::to_lowercase) else {
                continue;
            };
            let ok = match key.as_str() {
                "id" | "element_id" => self.id == want,
                "type" => self.element_type.to_lowercase() == want,
                "name" | "target" => self.name.to_lowercase().contains(&want),
                _ => continue,
            };
            if !ok {
                return false;
            }
            constrained = true;
        }
        constrained
    }
}

/// 当前 UI 状态的带时间戳描述；控制器把它原样交给 Action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// epoch 毫秒
    pub timestamp: i64,
    pub platform: String,
    pub description: String,
    pub focused_window: Option<String>,
    pub screen_resolution: (u32, u32),
    #[serde(default)]
    pub elements: Vec<ElementHandle>,
}

impl EnvironmentSnapshot {
    /// 无感知能力时使用的空快照
    pub fn blank() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            platform: std::env::consts::OS.to_string(),
            description: "no perception available".to_string(),
            focused_window: None,
            screen_resolution: (0, 0),
            elements: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Perception: Send + Sync {
    /// 当前 UI 状态；调用方负责施加超时
    async fn get_current_state(&self) -> Result<EnvironmentSnapshot, String>;

    /// 按属性查找元素；Ok(None) 表示未找到，Err 表示感知本身出错
    async fn find_element(&self, properties: &Parameters) -> Result<Option<ElementHandle>, String>;
}
