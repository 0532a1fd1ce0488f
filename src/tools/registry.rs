//! 工具注册表
//!
//! 每个工具由 ToolDefinition 描述（名称、描述、参数 schema、平台白名单、能力要求、处理器），
//! 并归属于一个来源模块。名称在全表唯一；同一模块重复注册视为热重载覆盖，不同模块同名则冲突。
//!
//! 三张表（工具、归属、模块 prompt 片段）放在同一把 RwLock 下，`replace_module` 在一次写锁内
//! 完成「卸载旧版本 + 注册新版本」，并发的 `execute` 不会看到两个版本共存或都不存在。
//! `execute` 从不向调用方传播错误：未知工具、处理器返回 Err 或 panic 都转为错误字符串。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::core::{panic_message, RegistryError};

/// 调用工具时附带的上下文
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub user_id: String,
    pub channel_id: String,
    pub platform: Option<String>,
    /// 工具进程的工作目录
    pub workspace: PathBuf,
    /// 平台相关数据
    pub extra: HashMap<String, Value>,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            ..Default::default()
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }
}

/// 工具处理器
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// 由闭包实现的处理器
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn call(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        (self.f)(args.clone(), ctx.clone()).await
    }
}

/// 把异步闭包包装成处理器
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// 工具定义
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
    /// 平台白名单，None 表示所有平台可用
    pub platforms: Option<Vec<String>>,
    /// 运行所需能力（如 sandbox），必须是环境能力集合的子集
    pub requires: BTreeSet<String>,
    /// 注册时由注册表填写
    pub source_module: String,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("platforms", &self.platforms)
            .field("requires", &self.requires)
            .field("source_module", &self.source_module)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
            handler,
            platforms: None,
            requires: BTreeSet::new(),
            source_module: String::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = Some(platforms.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    /// 是否可在给定平台与能力集合下使用；None 表示不按该维度过滤
    pub fn available(&self, platform: Option<&str>, capabilities: Option<&BTreeSet<String>>) -> bool {
        if let (Some(p), Some(allowed)) = (platform, &self.platforms) {
            if !allowed.iter().any(|a| a == p) {
                return false;
            }
        }
        match capabilities {
            Some(caps) => self.requires.is_subset(caps),
            None => true,
        }
    }

    /// OpenAI function calling 格式
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Default)]
struct RegistryState {
    tools: HashMap<String, ToolDefinition>,
    /// 工具名 -> 来源模块
    sources: HashMap<String, String>,
    /// 来源模块 -> prompt 片段
    system_prompts: BTreeMap<String, String>,
}

impl RegistryState {
    fn check_owner(&self, name: &str, source: &str) -> Result<(), RegistryError> {
        match self.sources.get(name) {
            Some(owner) if owner != source => Err(RegistryError::Conflict {
                name: name.to_string(),
                owner: owner.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, mut tool: ToolDefinition, source: &str) {
        tool.source_module = source.to_string();
        self.sources.insert(tool.name.clone(), source.to_string());
        self.tools.insert(tool.name.clone(), tool);
    }

    fn remove_module(&mut self, source: &str) -> Vec<String> {
        let mut removed: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, owner)| owner.as_str() == source)
            .map(|(name, _)| name.clone())
            .collect();
        removed.sort();
        for name in &removed {
            self.sources.remove(name);
            self.tools.remove(name);
        }
        self.system_prompts.remove(source);
        removed
    }

    fn has_module(&self, source: &str) -> bool {
        self.sources.values().any(|owner| owner == source)
    }
}

/// 工具注册表
#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册单个工具；名称已被其他模块占用时返回 Conflict
    pub async fn register(&self, tool: ToolDefinition, source_module: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        state.check_owner(&tool.name, source_module)?;
        tracing::debug!(tool = %tool.name, module = %source_module, "tool registered");
        state.insert(tool, source_module);
        Ok(())
    }

    /// 设置模块的 prompt 片段（空串表示移除）
    pub async fn set_system_prompt(&self, source_module: &str, prompt: &str) {
        let mut state = self.state.write().await;
        if prompt.trim().is_empty() {
            state.system_prompts.remove(source_module);
        } else {
            state
                .system_prompts
                .insert(source_module.to_string(), prompt.trim().to_string());
        }
    }

    /// 注销单个工具；模块的最后一个工具被注销时一并移除其 prompt 片段
    pub async fn unregister(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(source) = state.sources.remove(name) else {
            return false;
        };
        state.tools.remove(name);
        if !state.has_module(&source) {
            state.system_prompts.remove(&source);
        }
        true
    }

    /// 注销模块的所有工具与 prompt 片段，返回被移除的工具名（已排序）
    pub async fn unregister_module(&self, source_module: &str) -> Vec<String> {
        let removed = self.state.write().await.remove_module(source_module);
        if !removed.is_empty() {
            tracing::debug!(module = %source_module, count = removed.len(), "module unregistered");
        }
        removed
    }

    /// 在一次写锁内卸载模块旧版本并注册新版本
    ///
    /// 新版本与其他模块冲突时不注册任何新工具，旧版本仍会被移除，返回 Conflict。
    /// prompt 片段只在新版本至少有一个工具时注册。
    pub async fn replace_module(
        &self,
        source_module: &str,
        tools: Vec<ToolDefinition>,
        system_prompt: Option<&str>,
    ) -> Result<Vec<String>, RegistryError> {
        let mut state = self.state.write().await;
        let removed = state.remove_module(source_module);

        for tool in &tools {
            state.check_owner(&tool.name, source_module)?;
        }
        let has_tools = !tools.is_empty();
        for tool in tools {
            state.insert(tool, source_module);
        }
        if has_tools {
            if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
                state
                    .system_prompts
                    .insert(source_module.to_string(), prompt.to_string());
            }
        }
        Ok(removed)
    }

    pub async fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.state.read().await.tools.get(name).cloned()
    }

    /// 按平台与能力过滤的工具列表（按名称排序）
    pub async fn get_tools(
        &self,
        platform: Option<&str>,
        capabilities: Option<&BTreeSet<String>>,
    ) -> Vec<ToolDefinition> {
        let state = self.state.read().await;
        let mut tools: Vec<ToolDefinition> = state
            .tools
            .values()
            .filter(|t| t.available(platform, capabilities))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn tools_by_module(&self, source_module: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .sources
            .iter()
            .filter(|(_, owner)| owner.as_str() == source_module)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn source_of(&self, name: &str) -> Option<String> {
        self.state.read().await.sources.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tools.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.tools.is_empty()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.tools.contains_key(name)
    }

    /// 所有模块的 prompt 片段，以空行连接（按模块名排序）
    pub async fn system_prompts(&self) -> String {
        let state = self.state.read().await;
        state
            .system_prompts
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub async fn module_prompt(&self, source_module: &str) -> Option<String> {
        self.state.read().await.system_prompts.get(source_module).cloned()
    }

    /// 过滤后的工具列表，OpenAI function calling 格式
    pub async fn to_openai_tools(
        &self,
        platform: Option<&str>,
        capabilities: Option<&BTreeSet<String>>,
    ) -> Vec<Value> {
        self.get_tools(platform, capabilities)
            .await
            .iter()
            .map(ToolDefinition::to_openai_format)
            .collect()
    }

    /// 执行工具，任何失败都转为错误字符串；每次调用输出一条 JSON 审计日志
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> String {
        // 只在查找时持锁，处理器执行期间允许模块热替换
        let handler = {
            let state = self.state.read().await;
            match state.tools.get(name) {
                Some(tool) => Arc::clone(&tool.handler),
                None => {
                    let mut available: Vec<&str> = state.tools.keys().map(String::as_str).collect();
                    available.sort_unstable();
                    tracing::warn!(tool = %name, "unknown tool requested");
                    return format!(
                        "Error: Unknown tool '{}'. Available tools: {}",
                        name,
                        available.join(", ")
                    );
                }
            }
        };

        let start = Instant::now();
        let preview = args_preview(&args);
        let outcome = AssertUnwindSafe(handler.call(&args, ctx))
            .catch_unwind()
            .await;

        let (ok, label, output) = match outcome {
            Ok(Ok(content)) => (true, "ok", content),
            Ok(Err(e)) => (false, "error", format!("Error executing {}: {}", name, e)),
            Err(payload) => (
                false,
                "panic",
                format!("Error executing {}: panicked: {}", name, panic_message(payload.as_ref())),
            ),
        };

        let audit = json!({
            "event": "tool_audit",
            "tool": name,
            "ok": ok,
            "outcome": label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "user": ctx.user_id,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");
        output
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(name: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            "echo text",
            handler_fn(|args, _ctx| async move {
                let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("(empty)");
                Ok::<_, anyhow::Error>(text.to_string())
            }),
        )
    }

    fn failing(name: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            "always fails",
            handler_fn(|_args, _ctx| async move {
                Err::<String, _>(anyhow::anyhow!("disk on fire"))
            }),
        )
    }

    fn panicking(name: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            "always panics",
            handler_fn(|_args, _ctx| async move {
                let fuse: Option<String> = None;
                Ok::<_, anyhow::Error>(fuse.expect("boom"))
            }),
        )
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let r = ToolRegistry::new();
        r.register(echo("echo"), "core").await.unwrap();
        assert_eq!(r.len().await, 1);
        assert_eq!(r.source_of("echo").await.as_deref(), Some("core"));
        let out = r
            .execute("echo", json!({"text": "hi"}), &ToolContext::default())
            .await;
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_conflict_across_modules() {
        let r = ToolRegistry::new();
        r.register(echo("echo"), "a").await.unwrap();
        let err = r.register(echo("echo"), "b").await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                name: "echo".to_string(),
                owner: "a".to_string()
            }
        );
        // 同模块覆盖允许
        r.register(echo("echo"), "a").await.unwrap();
        assert_eq!(r.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available() {
        let r = ToolRegistry::new();
        r.register(echo("b_tool"), "m").await.unwrap();
        r.register(echo("a_tool"), "m").await.unwrap();
        let out = r.execute("nope", json!({}), &ToolContext::default()).await;
        assert_eq!(out, "Error: Unknown tool 'nope'. Available tools: a_tool, b_tool");
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_strings() {
        let r = ToolRegistry::new();
        r.register(failing("bad"), "m").await.unwrap();
        r.register(panicking("worse"), "m").await.unwrap();
        let ctx = ToolContext::default();
        assert_eq!(
            r.execute("bad", json!({}), &ctx).await,
            "Error executing bad: disk on fire"
        );
        let out = r.execute("worse", json!({}), &ctx).await;
        assert!(out.starts_with("Error executing worse: panicked: boom"));
        // 注册表仍可用
        assert_eq!(r.len().await, 2);
    }

    #[tokio::test]
    async fn test_filtering_by_platform_and_capabilities() {
        let r = ToolRegistry::new();
        r.register(echo("anywhere"), "m").await.unwrap();
        r.register(echo("discord_only").with_platforms(["discord"]), "m")
            .await
            .unwrap();
        r.register(echo("sandboxed").with_requires(["sandbox"]), "m")
            .await
            .unwrap();

        let names = |tools: Vec<ToolDefinition>| tools.into_iter().map(|t| t.name).collect::<Vec<_>>();

        assert_eq!(names(r.get_tools(None, None).await).len(), 3);
        assert_eq!(
            names(r.get_tools(Some("slack"), Some(&BTreeSet::new())).await),
            vec!["anywhere"]
        );
        let caps: BTreeSet<String> = ["sandbox".to_string()].into();
        assert_eq!(
            names(r.get_tools(Some("discord"), Some(&caps)).await),
            vec!["anywhere", "discord_only", "sandboxed"]
        );
    }

    #[tokio::test]
    async fn test_replace_module_swaps_atomically() {
        let r = ToolRegistry::new();
        r.replace_module("m", vec![echo("old_a"), echo("shared")], Some("v1 prompt"))
            .await
            .unwrap();
        let removed = r
            .replace_module("m", vec![echo("shared"), echo("new_b")], Some("v2 prompt"))
            .await
            .unwrap();
        assert_eq!(removed, vec!["old_a", "shared"]);
        assert_eq!(r.tools_by_module("m").await, vec!["new_b", "shared"]);
        assert!(!r.contains("old_a").await);
        assert_eq!(r.system_prompts().await, "v2 prompt");
    }

    #[tokio::test]
    async fn test_replace_module_conflict_leaves_module_unregistered() {
        let r = ToolRegistry::new();
        r.register(echo("taken"), "other").await.unwrap();
        r.replace_module("m", vec![echo("mine")], Some("p")).await.unwrap();

        let err = r
            .replace_module("m", vec![echo("mine"), echo("taken")], Some("p2"))
            .await;
        assert!(err.is_err());
        assert!(r.tools_by_module("m").await.is_empty());
        assert_eq!(r.source_of("taken").await.as_deref(), Some("other"));
        assert!(r.module_prompt("m").await.is_none());
    }

    #[tokio::test]
    async fn test_prompt_requires_tools() {
        let r = ToolRegistry::new();
        r.replace_module("empty", Vec::new(), Some("orphan prompt")).await.unwrap();
        assert!(r.module_prompt("empty").await.is_none());

        r.replace_module("a", vec![echo("x")], Some("alpha")).await.unwrap();
        r.replace_module("b", vec![echo("y")], Some("beta")).await.unwrap();
        assert_eq!(r.system_prompts().await, "alpha\n\nbeta");

        assert!(r.unregister("x").await);
        assert!(!r.unregister("x").await);
        assert_eq!(r.system_prompts().await, "beta");
        assert_eq!(r.unregister_module("b").await, vec!["y"]);
        assert!(r.is_empty().await);
    }

    #[tokio::test]
    async fn test_openai_format() {
        let r = ToolRegistry::new();
        r.register(
            echo("echo").with_parameters(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })),
            "core",
        )
        .await
        .unwrap();
        let tools = r.to_openai_tools(None, None).await;
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "echo");
        assert_eq!(tools[0]["function"]["parameters"]["required"][0], "text");
    }
}
