//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRAFTSMITH__*` 覆盖（双下划线表示嵌套，如 `DRAFTSMITH__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::recovery::RecoveryPolicy;
use crate::events::RecoveryConfig;
use crate::quality::{ThresholdOverrides, ThresholdProfile};
use crate::workflow::types::WorkflowConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub workflow: WorkflowSection,
    pub quality: QualitySection,
    pub recovery: RecoverySection,
}

/// [app] 段：应用名、检查点目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// JSON 检查点存放目录
    pub checkpoint_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒），0 表示不限制
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [workflow] 段：重试上限与每次运行的默认配置（[workflow.defaults]）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub max_retries: u32,
    pub defaults: WorkflowConfig,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            defaults: WorkflowConfig::default(),
        }
    }
}

/// [quality] 段：[quality.thresholds] 覆盖标准等级的阈值
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    pub thresholds: ThresholdOverrides,
}

impl QualitySection {
    pub fn profile(&self) -> ThresholdProfile {
        ThresholdProfile::with_overrides(&self.thresholds)
    }
}

/// [recovery] 段：退避、保留窗口与有界历史
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retention_hours: u64,
    pub event_log_capacity: usize,
    pub error_history_capacity: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            retention_hours: 24,
            event_log_capacity: 1000,
            error_history_capacity: 500,
        }
    }
}

impl RecoverySection {
    pub fn to_recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            policy: RecoveryPolicy::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
            retention: chrono::Duration::hours(self.retention_hours as i64),
            event_log_capacity: self.event_log_capacity,
            error_history_capacity: self.error_history_capacity,
        }
    }
}

/// 从 config 目录加载配置，环境变量 DRAFTSMITH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRAFTSMITH__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("DRAFTSMITH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
