//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PARLEY__*` 覆盖（双下划线表示嵌套，如 `PARLEY__REJECTION__THROTTLE=0.4`）。
//! 所有段都带默认值，空文件也是合法配置。

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Deserialize;

use crate::gateway::{IntentTables, RejectionPatterns, RejectionWeights, Tier, TierKeywords};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub tools: ToolsSection,
    pub intent: IntentSection,
    pub tier: TierSection,
    pub rejection: RejectionSection,
    pub pipeline: PipelineSection,
    pub session: SessionSection,
    pub memory: MemorySection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 工具进程的工作目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "parley".to_string(),
            workspace_root: None,
        }
    }
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [tools] 段：模块目录、热重载、运行平台与能力集合、工具超时、工具循环上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 工具模块目录（*.toml 或 <id>/module.toml）
    pub dir: PathBuf,
    /// 是否监听目录变更并热重载
    pub hot_reload: bool,
    /// 当前运行平台（用于过滤 platforms 白名单），None 表示不过滤
    pub platform: Option<String>,
    /// 当前环境提供的能力（如 sandbox），工具的 requires 必须是其子集
    pub capabilities: BTreeSet<String>,
    /// 单次工具进程调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 单次回复内最多几轮工具调用
    pub max_tool_iterations: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("config/tools"),
            hot_reload: true,
            platform: None,
            capabilities: BTreeSet::new(),
            tool_timeout_secs: 30,
            max_tool_iterations: 10,
        }
    }
}

/// [intent] 段：是否启用 LLM 二次判定及其置信度阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntentSection {
    pub use_llm: bool,
    /// 启发式置信度低于该值时才调用 LLM
    pub llm_threshold: f32,
    pub tables: IntentTables,
}

impl Default for IntentSection {
    fn default() -> Self {
        Self {
            use_llm: false,
            llm_threshold: 0.7,
            tables: IntentTables::default(),
        }
    }
}

/// [tier] 段：自动选档开关、默认档位、高档指标阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TierSection {
    pub auto_enabled: bool,
    pub default_tier: Tier,
    pub high_indicator_threshold: u32,
    pub keywords: TierKeywords,
}

impl Default for TierSection {
    fn default() -> Self {
        Self {
            auto_enabled: true,
            default_tier: Tier::Mid,
            high_indicator_threshold: 2,
            keywords: TierKeywords::default(),
        }
    }
}

/// [rejection] 段：群聊准入阈值、最短消息、机器人名、打分权重与正则
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RejectionSection {
    pub throttle: f32,
    pub min_length: usize,
    pub bot_name: String,
    pub weights: RejectionWeights,
    pub patterns: RejectionPatterns,
}

impl Default for RejectionSection {
    fn default() -> Self {
        Self {
            throttle: 0.35,
            min_length: 3,
            bot_name: "clarissa".to_string(),
            weights: RejectionWeights::default(),
            patterns: RejectionPatterns::default(),
        }
    }
}

/// [pipeline] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub enabled: bool,
    /// 每个阶段输出 debug 日志
    pub log_stages: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            enabled: true,
            log_stages: true,
        }
    }
}

/// [session] 段：群聊会话过期时间与缓冲上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub timeout_secs: u64,
    pub max_messages: usize,
    pub max_participants: usize,
    /// 后台清理过期会话的间隔
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_secs: 2 * 3600,
            max_messages: 50,
            max_participants: 20,
            cleanup_interval_secs: 300,
        }
    }
}

/// [memory] 段：记忆抽取工作池
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub workers: usize,
    pub queue_capacity: usize,
    /// 每个抽取任务最多尝试次数（至少一次投递）
    pub max_attempts: u32,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
            max_attempts: 3,
        }
    }
}

/// 从 config 目录加载配置，环境变量 PARLEY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PARLEY__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("PARLEY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（阈值类参数可在运行时重建分类器）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert!((cfg.rejection.throttle - 0.35).abs() < f32::EPSILON);
        assert_eq!(cfg.rejection.min_length, 3);
        assert_eq!(cfg.tier.default_tier, Tier::Mid);
        assert_eq!(cfg.tier.high_indicator_threshold, 2);
        assert_eq!(cfg.tools.max_tool_iterations, 10);
        assert_eq!(cfg.session.timeout_secs, 7200);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let text = r#"
            [rejection]
            throttle = 0.5
            bot_name = "parley"

            [tools]
            capabilities = ["sandbox"]
        "#;
        let cfg: AppConfig = toml::from_str(text).unwrap();
        assert!((cfg.rejection.throttle - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.rejection.bot_name, "parley");
        assert_eq!(cfg.rejection.min_length, 3);
        assert!(cfg.tools.capabilities.contains("sandbox"));
        assert!(cfg.tools.hot_reload);
        assert!(!cfg.intent.tables.simple_keywords.is_empty());
    }
}
