//! 频道运行时：把准入判定、群聊上下文、会话级队列与流水线串起来
//!
//! handle：记录到群聊会话 -> 解析档位前缀 -> 准入判定 -> 入队；
//! 拿到处理权的请求在独立任务中处理，处理完通过 release 接手同频道的下一个请求，直到队列为空。
//! release 由 ReleaseGuard 保证执行：即使处理任务被中止，排队的请求也会交给新任务继续处理。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::panic_message;
use crate::memory::Message;

use super::group_session::GroupSessionCache;
use super::intent::IntentContext;
use super::pipeline::{MessageContext, MessagePipeline, PipelineResult};
use super::rejection::{RejectionClassifier, RejectionContext, RejectionResult};
use super::task_queue::{Acquire, ChannelTaskQueue, QueuedRequest};
use super::tier::{parse_tier_prefix, Tier};

/// 流水线可见的最近消息条数
const HISTORY_LIMIT: usize = 20;

/// 平台适配层送入的消息
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub message_id: String,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub user_id: String,
    pub author_name: String,
    pub content: String,
    pub is_dm: bool,
    pub is_mentioned: bool,
    /// 回复的是机器人的消息
    pub is_reply: bool,
    pub has_attachments: bool,
}

impl InboundMessage {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>, content: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            author_name: user_id.clone(),
            user_id,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, name: impl Into<String>) -> Self {
        self.author_name = name.into();
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn direct(mut self) -> Self {
        self.is_dm = true;
        self
    }

    pub fn mentioned(mut self) -> Self {
        self.is_mentioned = true;
        self
    }
}

/// 发往平台适配层的回复
#[derive(Debug, Clone)]
pub struct Reply {
    pub request_id: String,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub user_id: String,
    pub result: PipelineResult,
}

/// handle 的结果
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// 准入判定为不回复
    Rejected(RejectionResult),
    /// 已开始处理
    Started { request_id: String },
    /// 同频道有请求在处理，已排队（position 从 1 开始）
    Queued { request_id: String, position: usize },
}

/// 频道运行时
pub struct ChannelRuntime {
    rejection: Arc<RejectionClassifier>,
    sessions: Arc<GroupSessionCache>,
    queue: Arc<ChannelTaskQueue>,
    pipeline: Arc<MessagePipeline>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl ChannelRuntime {
    pub fn new(
        pipeline: Arc<MessagePipeline>,
        rejection: Arc<RejectionClassifier>,
        sessions: Arc<GroupSessionCache>,
        queue: Arc<ChannelTaskQueue>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Reply>) {
        let (replies, rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(Self {
            rejection,
            sessions,
            queue,
            pipeline,
            replies,
        });
        (runtime, rx)
    }

    pub fn from_config(
        cfg: &AppConfig,
        pipeline: Arc<MessagePipeline>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Reply>) {
        Self::new(
            pipeline,
            Arc::new(RejectionClassifier::from_config(&cfg.rejection)),
            Arc::new(GroupSessionCache::new(&cfg.session)),
            Arc::new(ChannelTaskQueue::new()),
        )
    }

    pub fn rejection(&self) -> &Arc<RejectionClassifier> {
        &self.rejection
    }

    pub fn sessions(&self) -> &Arc<GroupSessionCache> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<ChannelTaskQueue> {
        &self.queue
    }

    /// 接收一条消息
    pub async fn handle(self: &Arc<Self>, msg: InboundMessage) -> Dispatch {
        let (manual_tier, text) = parse_tier_prefix(&msg.content);
        let text = text.to_string();

        // 不回复的消息也进入群聊上下文
        let message_count = self
            .sessions
            .with_session(&msg.channel_id, msg.thread_id.as_deref(), |s| {
                s.add_message(&msg.message_id, &msg.user_id, &msg.author_name, &text, None);
                s.message_count()
            })
            .await;

        // 准入只用规则意图，LLM 二次判定留给流水线
        let intent = self.pipeline.intent_detector().detect_heuristic(
            &text,
            &IntentContext {
                message_count: message_count.saturating_sub(1),
                is_dm: msg.is_dm,
                has_attachments: msg.has_attachments,
            },
        );
        let rejection_ctx = RejectionContext {
            is_dm: msg.is_dm,
            is_mentioned: msg.is_mentioned,
            is_reply: msg.is_reply,
            ..Default::default()
        };
        let verdict = self.rejection.classify(&text, &rejection_ctx, Some(&intent));
        if !verdict.should_respond {
            tracing::info!(
                channel = %msg.channel_id,
                user = %msg.user_id,
                code = verdict.code.as_str(),
                confidence = verdict.confidence,
                "message not answered"
            );
            return Dispatch::Rejected(verdict);
        }

        let mut request = QueuedRequest::new(&msg.channel_id, &msg.user_id, text)
            .with_metadata("message_id", json!(msg.message_id))
            .with_metadata("author_name", json!(msg.author_name))
            .with_metadata("is_dm", json!(msg.is_dm))
            .with_metadata("has_attachments", json!(msg.has_attachments));
        if let Some(tier) = manual_tier {
            request = request.with_metadata("manual_tier", json!(tier.as_str()));
        }
        if let Some(thread) = &msg.thread_id {
            request = request.with_thread(thread.clone());
        }

        let request_id = request.id.clone();
        match self.queue.try_acquire(request.clone()) {
            Acquire::Go => {
                tokio::spawn(Arc::clone(self).drive(request));
                Dispatch::Started { request_id }
            }
            Acquire::Queued { position } => {
                tracing::info!(channel = %msg.channel_id, request = %request_id, position, "request queued");
                Dispatch::Queued { request_id, position }
            }
        }
    }

    /// 处理一个频道：当前请求以及 release 交回的每一个后续请求
    async fn drive(self: Arc<Self>, first: QueuedRequest) {
        let channel = first.channel_id.clone();
        let mut current = Some(first);
        while let Some(request) = current.take() {
            let guard = ReleaseGuard {
                runtime: Arc::clone(&self),
                channel: channel.clone(),
                armed: true,
            };
            let result = match AssertUnwindSafe(self.process(&request)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(request = %request.id, panic = %message, "request processing panicked");
                    PipelineResult::failure(format!("panicked: {}", message))
                }
            };
            self.send_reply(&request, result);
            current = guard.finish();
        }
    }

    async fn process(&self, request: &QueuedRequest) -> PipelineResult {
        let mut ctx = MessageContext::channel(request.channel_id.clone());
        ctx.thread_id = request.thread_id.clone();
        ctx.is_dm = meta_flag(request, "is_dm");
        ctx.has_attachments = meta_flag(request, "has_attachments");

        if let Some(session) = self.sessions.get(&request.channel_id, request.thread_id.as_deref()).await {
            let message_id = request.metadata.get("message_id").and_then(Value::as_str);
            ctx.prior_messages = session
                .recent_messages(HISTORY_LIMIT + 1)
                .iter()
                .filter(|m| Some(m.message_id.as_str()) != message_id)
                .map(|m| Message::user(m.content.clone()).with_author(m.author_name.clone()))
                .collect();
            if ctx.prior_messages.len() > HISTORY_LIMIT {
                ctx.prior_messages.remove(0);
            }
            ctx.participants = session
                .active_participants()
                .iter()
                .map(|p| p.display_name.clone())
                .collect();

            let pronouns = session.resolve_pronouns(&request.content);
            if !pronouns.is_empty() {
                ctx.extra.insert("pronouns".to_string(), json!(pronouns));
            }
            let group_context = session.format_for_prompt();
            if !group_context.is_empty() {
                ctx.extra.insert("group_context".to_string(), Value::String(group_context));
            }
        }

        let manual_tier = request
            .metadata
            .get("manual_tier")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Tier>().ok());
        self.pipeline
            .process(&request.content, &request.user_id, ctx, manual_tier)
            .await
    }

    fn send_reply(&self, request: &QueuedRequest, result: PipelineResult) {
        if let Some(error) = &result.error {
            tracing::warn!(request = %request.id, error = %error, "request finished with error");
        }
        let reply = Reply {
            request_id: request.id.clone(),
            channel_id: request.channel_id.clone(),
            thread_id: request.thread_id.clone(),
            user_id: request.user_id.clone(),
            result,
        };
        if self.replies.send(reply).is_err() {
            tracing::debug!(request = %request.id, "reply receiver closed");
        }
    }
}

fn meta_flag(request: &QueuedRequest, key: &str) -> bool {
    request.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// 释放频道处理权；未经 finish 就被丢弃时，把交回的下一个请求交给新任务
struct ReleaseGuard {
    runtime: Arc<ChannelRuntime>,
    channel: String,
    armed: bool,
}

impl ReleaseGuard {
    fn finish(mut self) -> Option<QueuedRequest> {
        self.armed = false;
        self.runtime.queue.release(&self.channel)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(next) = self.runtime.queue.release(&self.channel) else {
            return;
        };
        tracing::warn!(channel = %self.channel, request = %next.id, "channel worker aborted, handing off");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Arc::clone(&self.runtime).drive(next));
            }
            Err(_) => {
                tracing::error!(channel = %self.channel, request = %next.id, "no runtime to hand off queued request");
            }
        }
    }
}
