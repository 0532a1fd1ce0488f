//! 带工具调用循环的回复生成器
//!
//! Plan -> Act (Tool) -> Observe，直到模型直接回复；超过 max_iterations 轮后追加一条
//! 「请总结」的用户消息，再调用一次模型作为最终回复。已发出的工具调用不会被中途取消。

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::config::AppConfig;
use crate::gateway::{GeneratedResponse, PipelineContext, ResponseGenerator, Tier};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{tool_call_schema_json, ToolContext, ToolRegistry};

use super::planner::{parse_llm_output, PlannerOutput, ToolCall};

/// 达到工具调用上限后追加的用户消息
pub const MAX_ITERATIONS_PROMPT: &str =
    "You've reached the maximum number of tool calls. Please summarize what you've accomplished.";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant taking part in a chat. Answer concisely.";

/// 工具循环生成器
pub struct ToolLoopGenerator {
    llm: Arc<dyn LlmClient>,
    /// 按档位覆盖的模型客户端，未配置的档位使用 llm
    tier_clients: HashMap<Tier, Arc<dyn LlmClient>>,
    registry: Arc<ToolRegistry>,
    platform: Option<String>,
    capabilities: Option<BTreeSet<String>>,
    workspace: PathBuf,
    max_iterations: usize,
    base_prompt: String,
}

impl ToolLoopGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            tier_clients: HashMap::new(),
            registry,
            platform: None,
            capabilities: None,
            workspace: PathBuf::from("workspace"),
            max_iterations: 10,
            base_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, cfg: &AppConfig) -> Self {
        let mut generator = Self::new(llm, registry)
            .with_capabilities(cfg.tools.capabilities.clone())
            .with_max_iterations(cfg.tools.max_tool_iterations)
            .with_workspace(cfg.app.workspace());
        generator.platform = cfg.tools.platform.clone();
        generator
    }

    pub fn with_tier_client(mut self, tier: Tier, llm: Arc<dyn LlmClient>) -> Self {
        self.tier_clients.insert(tier, llm);
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: BTreeSet<String>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_base_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_prompt = prompt.into();
        self
    }

    fn client_for(&self, tier: Tier) -> &Arc<dyn LlmClient> {
        self.tier_clients.get(&tier).unwrap_or(&self.llm)
    }

    /// 基础 prompt + 各模块 prompt 片段 + 当前可用工具 + 调用格式 schema
    pub async fn build_system_prompt(&self) -> String {
        let mut prompt = self.base_prompt.clone();

        let fragments = self.registry.system_prompts().await;
        if !fragments.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&fragments);
        }

        let tools = self
            .registry
            .to_openai_tools(self.platform.as_deref(), self.capabilities.as_ref())
            .await;
        if tools.is_empty() {
            return prompt;
        }
        prompt.push_str("\n\n## Available tools\n");
        for tool in &tools {
            prompt.push_str(&tool.to_string());
            prompt.push('\n');
        }
        prompt.push_str(
            "\nTo call a tool, reply with ONLY a JSON object matching this schema, then wait for the result:\n",
        );
        prompt.push_str(&tool_call_schema_json());
        prompt
    }

    async fn call_tool(&self, call: &ToolCall, ctx: &PipelineContext) -> String {
        let offered = self
            .registry
            .get_tool(&call.tool)
            .await
            .map(|t| t.available(self.platform.as_deref(), self.capabilities.as_ref()));
        if offered == Some(false) {
            tracing::warn!(tool = %call.tool, "model requested a tool not offered here");
            return format!("Error: tool '{}' is not available here", call.tool);
        }

        let tool_ctx = ToolContext {
            user_id: ctx.user_id.clone(),
            channel_id: ctx.channel_id.clone(),
            platform: self.platform.clone(),
            workspace: self.workspace.clone(),
            extra: ctx.extra.clone(),
        };
        self.registry.execute(&call.tool, call.args.clone(), &tool_ctx).await
    }
}

#[async_trait]
impl ResponseGenerator for ToolLoopGenerator {
    async fn generate(&self, ctx: &PipelineContext) -> anyhow::Result<GeneratedResponse> {
        let llm = self.client_for(ctx.tier);
        let mut messages = Vec::with_capacity(ctx.prior_messages.len() + 2);
        messages.push(Message::system(self.build_system_prompt().await));
        messages.extend(ctx.prior_messages.iter().cloned());
        messages.push(Message::user(ctx.message.clone()));

        let mut tools_used = Vec::new();
        for iteration in 0..self.max_iterations {
            let reply = llm
                .complete(&messages)
                .await
                .map_err(|e| anyhow!("LLM error: {}", e))?;

            let call = match parse_llm_output(&reply) {
                PlannerOutput::Response(text) => {
                    return Ok(GeneratedResponse {
                        text,
                        attachments: Vec::new(),
                        tools_used,
                    })
                }
                PlannerOutput::ToolCall(call) => call,
            };

            tracing::info!(iteration, tool = %call.tool, backend = llm.name(), "tool call");
            let observation = self.call_tool(&call, ctx).await;
            tools_used.push(call.tool.clone());
            messages.push(Message::assistant(reply));
            messages.push(Message::tool(format!("[{}] {}", call.tool, observation)));
        }

        tracing::warn!(max = self.max_iterations, "tool iteration cap reached, requesting summary");
        messages.push(Message::user(MAX_ITERATIONS_PROMPT));
        let text = llm
            .complete(&messages)
            .await
            .map_err(|e| anyhow!("LLM error: {}", e))?;
        Ok(GeneratedResponse {
            text,
            attachments: Vec::new(),
            tools_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::Role;
    use crate::tools::{CoreModule, ToolDefinition, ToolModule};

    async fn registry_with_core() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        let core = CoreModule;
        registry
            .replace_module("core", core.tools(), core.system_prompt().as_deref())
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_direct_answer() {
        let llm = Arc::new(ScriptedLlmClient::new(["Four."]));
        let generator = ToolLoopGenerator::new(llm.clone(), registry_with_core().await);
        let out = generator
            .generate(&PipelineContext::new("what's 2+2?", "u1", "c1"))
            .await
            .unwrap();
        assert_eq!(out.text, "Four.");
        assert!(out.tools_used.is_empty());

        let first = llm.call(0).unwrap();
        assert_eq!(first[0].role, Role::System);
        assert!(first[0].content.contains("time_now"));
        assert_eq!(first.last().unwrap().content, "what's 2+2?");
    }

    #[tokio::test]
    async fn test_tool_result_fed_back() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"tool": "echo", "args": {"text": "pong"}}"#,
            "The tool said pong.",
        ]));
        let generator = ToolLoopGenerator::new(llm.clone(), registry_with_core().await);
        let out = generator
            .generate(&PipelineContext::new("ping it", "u1", "c1"))
            .await
            .unwrap();
        assert_eq!(out.text, "The tool said pong.");
        assert_eq!(out.tools_used, vec!["echo"]);

        let second = llm.call(1).unwrap();
        let observation = second.last().unwrap();
        assert_eq!(observation.role, Role::Tool);
        assert_eq!(observation.content, "[echo] pong");
    }

    #[tokio::test]
    async fn test_iteration_cap_forces_summary() {
        let call = r#"{"tool": "echo", "args": {"text": "again"}}"#;
        let mut script = vec![call; 3];
        script.push("Summary: echoed three times.");
        let llm = Arc::new(ScriptedLlmClient::new(script));
        let generator =
            ToolLoopGenerator::new(llm.clone(), registry_with_core().await).with_max_iterations(3);
        let out = generator
            .generate(&PipelineContext::new("loop", "u1", "c1"))
            .await
            .unwrap();
        assert_eq!(out.text, "Summary: echoed three times.");
        assert_eq!(out.tools_used.len(), 3);
        assert_eq!(llm.call_count(), 4);
        let last = llm.call(3).unwrap();
        assert_eq!(last.last().unwrap().content, MAX_ITERATIONS_PROMPT);
    }

    #[tokio::test]
    async fn test_unavailable_tool_not_executed() {
        let registry = registry_with_core().await;
        registry
            .register(
                ToolDefinition::new(
                    "sandbox_run",
                    "run code",
                    crate::tools::handler_fn(|_args, _ctx| async { Ok::<_, anyhow::Error>("ran".to_string()) }),
                )
                .with_requires(["sandbox"]),
                "sandbox",
            )
            .await
            .unwrap();

        let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "sandbox_run", "args": {}}"#, "ok"]));
        let generator =
            ToolLoopGenerator::new(llm.clone(), registry).with_capabilities(BTreeSet::new());
        assert!(!generator.build_system_prompt().await.contains("sandbox_run"));
        generator
            .generate(&PipelineContext::new("run", "u1", "c1"))
            .await
            .unwrap();
        let observation = llm.call(1).unwrap().last().unwrap().content.clone();
        assert!(observation.contains("not available"));
    }

    #[tokio::test]
    async fn test_tier_client_selected() {
        let default_llm = Arc::new(ScriptedLlmClient::new(["from mid"]));
        let high_llm = Arc::new(ScriptedLlmClient::new(["from high"]));
        let generator = ToolLoopGenerator::new(default_llm.clone(), registry_with_core().await)
            .with_tier_client(Tier::High, high_llm.clone());
        let mut ctx = PipelineContext::new("design a system", "u1", "c1");
        ctx.tier = Tier::High;
        assert_eq!(generator.generate(&ctx).await.unwrap().text, "from high");
        assert_eq!(default_llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_error_propagates() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        llm.push_error("rate limited");
        let generator = ToolLoopGenerator::new(llm, registry_with_core().await);
        let err = generator
            .generate(&PipelineContext::new("hi", "u1", "c1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }
}
