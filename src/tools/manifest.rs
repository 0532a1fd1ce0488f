//! 工具模块清单（TOML）
//!
//! 单文件模块 `<dir>/<id>.toml`，或包目录 `<dir>/<id>/module.toml`：
//!
//! ```toml
//! name = "datetime"
//! version = "1.0.0"
//! system_prompt = "Use `date_now` when the user asks about the current date."
//!
//! [initialize]
//! program = "mkdir"
//! args = ["-p", "{{workspace}}/datetime"]
//!
//! [[tools]]
//! name = "date_now"
//! description = "Current date and time"
//! program = "date"
//! args = ["+%Y-%m-%d %H:%M:%S"]
//! platforms = ["discord", "cli"]
//! requires = []
//!
//! [tools.parameters]
//! type = "object"
//! properties = {}
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::LoaderError;

use super::module::ToolModule;
use super::plugin::{run_command, CommandHandler};
use super::registry::ToolDefinition;

/// 包目录模块的清单文件名
pub const MODULE_MANIFEST: &str = "module.toml";

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_parameters() -> Value {
    json!({"type": "object", "properties": {}, "required": []})
}

/// 生命周期钩子命令
#[derive(Debug, Clone, Deserialize)]
pub struct HookCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// 清单中的单个工具
#[derive(Debug, Clone, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub platforms: Option<Vec<String>>,
    #[serde(default)]
    pub requires: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// 模块清单
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleManifest {
    pub name: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub system_prompt: Option<String>,
    pub initialize: Option<HookCommand>,
    pub cleanup: Option<HookCommand>,
    #[serde(default)]
    pub tools: Vec<ToolManifest>,
}

impl ModuleManifest {
    /// 解析并校验清单文本
    pub fn parse(module_id: &str, text: &str) -> Result<Self, LoaderError> {
        let manifest: ModuleManifest =
            toml::from_str(text).map_err(|e| LoaderError::InvalidManifest {
                module: module_id.to_string(),
                reason: e.to_string(),
            })?;

        if manifest.tools.is_empty() {
            return Err(LoaderError::NoTools(module_id.to_string()));
        }
        let mut names = HashSet::new();
        for tool in &manifest.tools {
            let invalid = |reason: String| LoaderError::InvalidManifest {
                module: module_id.to_string(),
                reason,
            };
            if tool.name.trim().is_empty() {
                return Err(invalid("tool with empty name".to_string()));
            }
            if !names.insert(tool.name.trim()) {
                return Err(invalid(format!("duplicate tool name '{}'", tool.name)));
            }
            if tool.program.trim().is_empty() {
                return Err(invalid(format!("tool '{}' has no program", tool.name)));
            }
            if !tool.parameters.is_object() {
                return Err(invalid(format!("tool '{}' parameters must be a table", tool.name)));
            }
        }
        Ok(manifest)
    }

    pub fn load(module_id: &str, path: &Path) -> Result<Self, LoaderError> {
        let text = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(module_id, &text)
    }
}

/// 由清单构建的模块，工具由进程型处理器实现
pub struct ManifestModule {
    id: String,
    manifest: ModuleManifest,
    workspace: PathBuf,
    default_timeout: Duration,
}

impl ManifestModule {
    pub fn new(
        id: impl Into<String>,
        manifest: ModuleManifest,
        workspace: impl Into<PathBuf>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            manifest,
            workspace: workspace.into(),
            default_timeout,
        }
    }

    fn timeout(&self, secs: Option<u64>) -> Duration {
        secs.map(Duration::from_secs).unwrap_or(self.default_timeout)
    }

    async fn run_hook(&self, hook: &HookCommand, phase: &str) -> anyhow::Result<()> {
        let workspace = self.workspace.to_string_lossy();
        let args: Vec<String> = hook
            .args
            .iter()
            .map(|a| a.replace("{{workspace}}", &workspace))
            .collect();
        tracing::debug!(module = %self.id, phase, program = %hook.program, "running module hook");
        run_command(&hook.program, &args, &self.workspace, self.timeout(hook.timeout_secs)).await?;
        Ok(())
    }
}

#[async_trait]
impl ToolModule for ManifestModule {
    fn name(&self) -> &str {
        self.manifest.name.as_deref().unwrap_or(&self.id)
    }

    fn version(&self) -> &str {
        &self.manifest.version
    }

    fn system_prompt(&self) -> Option<String> {
        self.manifest.system_prompt.clone()
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        self.manifest
            .tools
            .iter()
            .map(|t| {
                let handler = CommandHandler::new(
                    t.name.clone(),
                    t.program.clone(),
                    t.args.clone(),
                    self.timeout(t.timeout_secs),
                );
                let mut def = ToolDefinition::new(t.name.clone(), t.description.clone(), Arc::new(handler))
                    .with_parameters(t.parameters.clone())
                    .with_requires(t.requires.iter().cloned());
                if let Some(platforms) = &t.platforms {
                    def = def.with_platforms(platforms.iter().cloned());
                }
                def
            })
            .collect()
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        match &self.manifest.initialize {
            Some(hook) => self.run_hook(hook, "initialize").await,
            None => Ok(()),
        }
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        match &self.manifest.cleanup {
            Some(hook) => self.run_hook(hook, "cleanup").await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        name = "datetime"
        version = "1.2.0"
        system_prompt = "Dates are available."

        [[tools]]
        name = "date_now"
        description = "Current date"
        program = "date"
        platforms = ["cli"]
        requires = ["clock"]

        [tools.parameters]
        type = "object"
        required = []

        [tools.parameters.properties.format]
        type = "string"

        [[tools]]
        name = "echo_text"
        description = "Echo"
        program = "echo"
        args = ["{{text}}"]
    "#;

    #[test]
    fn test_parse_manifest() {
        let m = ModuleManifest::parse("dt", SAMPLE).unwrap();
        assert_eq!(m.version, "1.2.0");
        assert_eq!(m.tools.len(), 2);
        assert_eq!(m.tools[0].parameters["properties"]["format"]["type"], "string");
        assert_eq!(m.tools[1].parameters["type"], "object");

        let module = ManifestModule::new("dt", m, "/tmp", Duration::from_secs(5));
        assert_eq!(module.name(), "datetime");
        let tools = module.tools();
        assert_eq!(tools[0].platforms.as_deref(), Some(&["cli".to_string()][..]));
        assert!(tools[0].requires.contains("clock"));
        assert!(tools[1].platforms.is_none());
    }

    #[test]
    fn test_no_tools_rejected() {
        let err = ModuleManifest::parse("empty", "name = \"empty\"").unwrap_err();
        assert!(matches!(err, LoaderError::NoTools(ref id) if id == "empty"));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let err = ModuleManifest::parse("bad", "[[tools]\nname = ").unwrap_err();
        assert!(matches!(err, LoaderError::InvalidManifest { .. }));
    }

    #[test]
    fn test_tool_without_program_rejected() {
        let text = r#"
            [[tools]]
            name = "x"
            description = "y"
            program = " "
        "#;
        assert!(matches!(
            ModuleManifest::parse("m", text),
            Err(LoaderError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_duplicate_tool_names_rejected() {
        let text = r#"
            [[tools]]
            name = "fetch"
            description = "a"
            program = "curl"

            [[tools]]
            name = "fetch"
            description = "b"
            program = "wget"
        "#;
        match ModuleManifest::parse("net", text) {
            Err(LoaderError::InvalidManifest { module, reason }) => {
                assert_eq!(module, "net");
                assert!(reason.contains("duplicate tool name 'fetch'"));
            }
            other => panic!("unexpected {:?}", other.map(|m| m.tools.len())),
        }
    }
}
