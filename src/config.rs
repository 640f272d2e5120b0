//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DESKPILOT__*` 覆盖（双下划线表示嵌套，如 `DESKPILOT__EXECUTOR__STEP_TIMEOUT_MS=3000`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub executor: ExecutorSection,
    pub memory: MemorySection,
    pub action: ActionSection,
    pub planner: PlannerSection,
}

/// [app] 段：名称、检索条数、规划时是否采集环境快照
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 规划前从经验库检索的条数
    pub retrieve_top_k: usize,
    /// 规划前是否先向 Perception 请求一次快照
    pub plan_with_snapshot: bool,
    /// 已结束的运行在登记表中保留多久（秒），之后 get_status 返回 None
    pub finished_run_ttl_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            retrieve_top_k: 3,
            plan_with_snapshot: true,
            finished_run_ttl_secs: 3600,
        }
    }
}

impl AppSection {
    pub fn finished_run_ttl(&self) -> Duration {
        Duration::from_secs(self.finished_run_ttl_secs)
    }
}

/// [llm] 段：规划 oracle 后端与嵌入模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// rules / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 仅 provider=openai 时使用；否则走本地哈希嵌入
    pub embedding_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "rules".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            embedding_model: None,
        }
    }
}

/// [executor] 段：单步超时、感知超时、补救次数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub step_timeout_ms: u64,
    pub perception_timeout_ms: u64,
    /// 每个步骤最多尝试几次补救动作；0 表示只记录并停止
    pub max_recovery_attempts: u32,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: 10_000,
            perception_timeout_ms: 5_000,
            max_recovery_attempts: 1,
        }
    }
}

impl ExecutorSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms.max(1))
    }

    pub fn perception_timeout(&self) -> Duration {
        Duration::from_millis(self.perception_timeout_ms.max(1))
    }
}

/// [memory] 段：SQLite 路径、嵌入维度、保留策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 未设置时经验库只在内存中
    pub path: Option<PathBuf>,
    pub embedding_dim: usize,
    pub retention: RetentionSection,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            path: None,
            embedding_dim: 256,
            retention: RetentionSection::default(),
        }
    }
}

/// [memory.retention] 段：各项均可省略，省略即不启用该条规则
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RetentionSection {
    pub max_age_secs: Option<u64>,
    pub min_hits: Option<u64>,
    pub min_hits_grace_secs: Option<u64>,
    pub max_records: Option<usize>,
}

/// [action] 段：模拟输入驱动的参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActionSection {
    /// 每个动作成功后等待 UI 刷新的毫秒数
    pub default_delay_ms: u64,
    /// wait 动作的最长等待秒数
    pub max_wait_secs: f64,
    pub known_apps: Vec<String>,
}

impl Default for ActionSection {
    fn default() -> Self {
        Self {
            default_delay_ms: 100,
            max_wait_secs: 10.0,
            known_apps: default_known_apps(),
        }
    }
}

fn default_known_apps() -> Vec<String> {
    vec![
        "TextEditor".into(),
        "Notepad".into(),
        "Explorer".into(),
        "Browser".into(),
        "Terminal".into(),
        "Calculator".into(),
    ]
}

/// [planner] 段：禁用的动作类型、是否复用成功经验
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub disabled_kinds: Vec<String>,
    pub replay_experience: bool,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            disabled_kinds: Vec::new(),
            replay_experience: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 DESKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DESKPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DESKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时记录警告并回退到默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.retrieve_top_k, 3);
        assert_eq!(cfg.executor.max_recovery_attempts, 1);
        assert_eq!(cfg.memory.embedding_dim, 256);
        assert!(cfg.memory.path.is_none());
        assert!(cfg.action.known_apps.iter().any(|a| a == "TextEditor"));
    }

    #[test]
    fn test_load_explicit_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[executor]\nstep_timeout_ms = 250\n\n[memory]\nembedding_dim = 64\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.executor.step_timeout_ms, 250);
        assert_eq!(cfg.executor.step_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.memory.embedding_dim, 64);
        // 未出现的段落保持默认
        assert_eq!(cfg.app.retrieve_top_k, 3);
    }
}
