//! 多阶段消息流水线
//!
//! 1. 意图识别（启发式，必要时模型二次判定）
//! 2. 档位选择（规则）
//! 3. 回复生成（ResponseGenerator，通常是带工具循环的生成器）
//! 4. 记忆抽取（投递到 MemoryWorkerPool，不阻塞返回）
//!
//! 每个阶段计时写入 stage_times。前三个阶段的错误与 panic 折叠进 PipelineResult.error，
//! `process` 本身从不返回错误。

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;

use crate::config::AppConfig;
use crate::core::{panic_message, PipelineError};
use crate::llm::LlmClient;
use crate::memory::{MemoryWorkerPool, Message};

use super::intent::{IntentContext, IntentDetector, IntentResult};
use super::tier::{tier_display, Tier, TierContext, TierSelector};

pub const STAGE_INTENT: &str = "intent_detection";
pub const STAGE_TIER: &str = "tier_selection";
pub const STAGE_GENERATION: &str = "response_generation";
pub const STAGE_MEMORY: &str = "memory_extraction";

/// 调用方提供的请求上下文（平台适配层填充）
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub is_dm: bool,
    pub has_attachments: bool,
    /// 之前的消息
    pub prior_messages: Vec<Message>,
    /// 群聊参与者显示名
    pub participants: Vec<String>,
    /// 平台相关数据
    pub extra: HashMap<String, Value>,
}

impl MessageContext {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Default::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.prior_messages = messages;
        self
    }
}

/// 单次 process 调用内贯穿各阶段的上下文
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub message: String,
    pub user_id: String,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub is_dm: bool,
    pub has_attachments: bool,
    pub prior_messages: Vec<Message>,
    pub participants: Vec<String>,
    pub manual_tier: Option<Tier>,
    pub intent: Option<IntentResult>,
    pub tier: Tier,
    pub stage_times: BTreeMap<String, Duration>,
    pub extra: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
}

impl PipelineContext {
    pub fn new(message: impl Into<String>, user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self::from_request(message, user_id, MessageContext::channel(channel_id), None)
    }

    pub fn from_request(
        message: impl Into<String>,
        user_id: impl Into<String>,
        request: MessageContext,
        manual_tier: Option<Tier>,
    ) -> Self {
        Self {
            message: message.into(),
            user_id: user_id.into(),
            channel_id: request.channel_id,
            thread_id: request.thread_id,
            is_dm: request.is_dm,
            has_attachments: request.has_attachments,
            prior_messages: request.prior_messages,
            participants: request.participants,
            manual_tier,
            intent: None,
            tier: Tier::default(),
            stage_times: BTreeMap::new(),
            extra: request.extra,
            started_at: Utc::now(),
        }
    }
}

/// 回复生成结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedResponse {
    pub text: String,
    /// 需要随回复发送的文件
    pub attachments: Vec<String>,
    pub tools_used: Vec<String>,
}

impl GeneratedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// 回复生成协作者
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, ctx: &PipelineContext) -> anyhow::Result<GeneratedResponse>;
}

/// 流水线结果
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub response: String,
    pub tier: Tier,
    pub intent: Option<IntentResult>,
    pub tools_used: Vec<String>,
    pub attachments: Vec<String>,
    pub stage_times: BTreeMap<String, Duration>,
    pub error: Option<String>,
}

impl PipelineResult {
    /// 未进入任何阶段就失败的结果
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            response: String::new(),
            tier: Tier::default(),
            intent: None,
            tools_used: Vec::new(),
            attachments: Vec::new(),
            stage_times: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    /// 无错误且回复非空
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.response.is_empty()
    }
}

/// 消息流水线
pub struct MessagePipeline {
    intent: IntentDetector,
    tiers: TierSelector,
    generator: Option<Arc<dyn ResponseGenerator>>,
    memory: Option<Arc<MemoryWorkerPool>>,
    enabled: bool,
    log_stages: bool,
}

impl MessagePipeline {
    pub fn new(intent: IntentDetector, tiers: TierSelector) -> Self {
        Self {
            intent,
            tiers,
            generator: None,
            memory: None,
            enabled: true,
            log_stages: true,
        }
    }

    /// llm 只用于意图二次判定（intent.use_llm 开启时）
    pub fn from_config(cfg: &AppConfig, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let mut pipeline = Self::new(
            IntentDetector::from_config(&cfg.intent, llm),
            TierSelector::from_config(&cfg.tier),
        );
        pipeline.enabled = cfg.pipeline.enabled;
        pipeline.log_stages = cfg.pipeline.log_stages;
        pipeline
    }

    pub fn with_generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_memory_pool(mut self, pool: Arc<MemoryWorkerPool>) -> Self {
        self.memory = Some(pool);
        self
    }

    /// 关闭时跳过意图与选档，直接生成回复（档位取手动指定或 mid）
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn intent_detector(&self) -> &IntentDetector {
        &self.intent
    }

    pub fn memory_pool(&self) -> Option<&Arc<MemoryWorkerPool>> {
        self.memory.as_ref()
    }

    /// 处理一条消息
    pub async fn process(
        &self,
        message: &str,
        user_id: &str,
        request: MessageContext,
        manual_tier: Option<Tier>,
    ) -> PipelineResult {
        self.run(PipelineContext::from_request(message, user_id, request, manual_tier))
            .await
    }

    /// 处理已构建好的上下文
    pub async fn run(&self, mut ctx: PipelineContext) -> PipelineResult {
        let outcome = self.run_stages(&mut ctx).await;
        let intent = ctx.intent.clone();
        let tier = ctx.tier;

        match outcome {
            Ok(generated) => {
                let mut stage_times = ctx.stage_times.clone();
                if let Some(pool) = &self.memory {
                    let start = Instant::now();
                    if !pool.submit(Arc::new(ctx), generated.text.clone()) {
                        tracing::debug!("memory extraction skipped");
                    }
                    stage_times.insert(STAGE_MEMORY.to_string(), start.elapsed());
                }
                PipelineResult {
                    response: generated.text,
                    tier,
                    intent,
                    tools_used: generated.tools_used,
                    attachments: generated.attachments,
                    stage_times,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(user = %ctx.user_id, channel = %ctx.channel_id, error = %e, "pipeline failed");
                PipelineResult {
                    response: String::new(),
                    tier,
                    intent,
                    tools_used: Vec::new(),
                    attachments: Vec::new(),
                    stage_times: ctx.stage_times,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_stages(&self, ctx: &mut PipelineContext) -> Result<GeneratedResponse, PipelineError> {
        if self.enabled {
            self.stage_intent(ctx).await?;
            self.stage_tier(ctx)?;
        } else {
            ctx.tier = ctx.manual_tier.unwrap_or_default();
        }
        self.stage_generate(ctx).await
    }

    async fn stage_intent(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let start = Instant::now();
        let intent_ctx = IntentContext {
            message_count: ctx.prior_messages.len(),
            is_dm: ctx.is_dm,
            has_attachments: ctx.has_attachments,
        };
        let intent = AssertUnwindSafe(self.intent.detect(&ctx.message, &intent_ctx))
            .catch_unwind()
            .await
            .map_err(|_| PipelineError::Panicked(STAGE_INTENT))?;
        ctx.stage_times.insert(STAGE_INTENT.to_string(), start.elapsed());

        if self.log_stages {
            tracing::debug!(intent = %intent, "pipeline intent");
        }
        ctx.intent = Some(intent);
        Ok(())
    }

    fn stage_tier(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let start = Instant::now();
        let tier_ctx = TierContext {
            message: ctx.message.clone(),
            message_count: ctx.prior_messages.len(),
            manual_tier: ctx.manual_tier,
        };
        let tier = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.tiers.select(ctx.intent.as_ref(), &tier_ctx, ctx.manual_tier)
        }))
        .map_err(|_| PipelineError::Panicked(STAGE_TIER))?;
        ctx.tier = tier;
        ctx.stage_times.insert(STAGE_TIER.to_string(), start.elapsed());

        if self.log_stages {
            let (emoji, label) = tier_display(tier);
            let reason = self.tiers.tier_reason(tier, ctx.intent.as_ref(), &tier_ctx);
            tracing::debug!(tier = %tier, emoji, label, reason = %reason, "pipeline tier");
        }
        Ok(())
    }

    async fn stage_generate(&self, ctx: &mut PipelineContext) -> Result<GeneratedResponse, PipelineError> {
        let generator = self.generator.as_ref().ok_or(PipelineError::NoGenerator)?;
        let start = Instant::now();
        let outcome = AssertUnwindSafe(generator.generate(ctx)).catch_unwind().await;
        ctx.stage_times.insert(STAGE_GENERATION.to_string(), start.elapsed());

        let generated = match outcome {
            Ok(Ok(generated)) => generated,
            Ok(Err(e)) => return Err(PipelineError::Generation(e.to_string())),
            Err(payload) => {
                tracing::error!(panic = %panic_message(payload.as_ref()), "response generator panicked");
                return Err(PipelineError::Panicked(STAGE_GENERATION));
            }
        };

        if self.log_stages {
            tracing::debug!(
                chars = generated.text.chars().count(),
                files = generated.attachments.len(),
                tools = generated.tools_used.len(),
                "pipeline response"
            );
        }
        Ok(generated)
    }
}
