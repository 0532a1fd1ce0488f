//! 网关层：每条入站消息的决策链
//!
//! ```text
//! 入站消息 -> 准入判定（rejection）-> 群聊上下文（group_session）
//!          -> 会话级队列（task_queue）-> 流水线（pipeline：intent -> tier -> 生成 -> 记忆抽取）
//! ```
//!
//! runtime::ChannelRuntime 把以上环节串起来；各环节也可单独使用。

pub mod group_session;
pub mod intent;
pub mod pipeline;
pub mod rejection;
pub mod runtime;
pub mod task_queue;
pub mod tier;

pub use group_session::{
    session_key, ConversationTopic, GroupSession, GroupSessionCache, MessageReference, Participant,
};
pub use intent::{Complexity, IntentContext, IntentDetector, IntentResult, IntentTables, IntentType};
pub use pipeline::{
    GeneratedResponse, MessageContext, MessagePipeline, PipelineContext, PipelineResult, ResponseGenerator,
};
pub use rejection::{
    RejectionClassifier, RejectionCode, RejectionContext, RejectionPatterns, RejectionResult, RejectionWeights,
};
pub use runtime::{ChannelRuntime, Dispatch, InboundMessage, Reply};
pub use task_queue::{Acquire, ChannelTaskQueue, QueueStats, QueuedRequest, RequestId};
pub use tier::{parse_tier_prefix, tier_display, Tier, TierContext, TierKeywords, TierSelector};
