//! 会话级任务队列
//!
//! 每个频道同一时刻最多处理一个请求，其余按到达顺序排队：
//! - `try_acquire`：频道空闲则直接放行，否则入队并返回 1 起始的位置
//! - `release`：弹出队首并置为活跃交给调用方处理；队列为空则清除活跃标记
//!
//! 整张表由一把 std Mutex 保护，锁内只做簿记，从不覆盖请求处理本身。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// 请求 ID
pub type RequestId = String;

/// 排队中的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub user_id: String,
    pub content: String,
    /// 平台相关的附加数据
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// 到达时间（毫秒时间戳）
    pub queued_at: i64,
    /// 入队时的位置（1 起始；直接放行的请求为 0）
    pub position: usize,
}

impl QueuedRequest {
    pub fn new(
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("req_{}", uuid::Uuid::new_v4()),
            channel_id: channel_id.into(),
            thread_id: None,
            user_id: user_id.into(),
            content: content.into(),
            metadata: HashMap::new(),
            queued_at: chrono::Utc::now().timestamp_millis(),
            position: 0,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// try_acquire 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// 频道空闲，请求已成为活跃请求，调用方应立即处理
    Go,
    /// 已入队，position 从 1 开始
    Queued { position: usize },
}

#[derive(Debug, Default)]
struct ChannelQueueState {
    active: Option<QueuedRequest>,
    queue: VecDeque<QueuedRequest>,
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// 有活跃请求的频道数
    pub active_channels: usize,
    /// 所有频道排队中的请求总数
    pub queued_requests: usize,
    /// 累计直接放行
    pub total_started: u64,
    /// 累计入队
    pub total_queued: u64,
    /// 累计由 release 交接
    pub total_handed_off: u64,
}

#[derive(Debug, Default)]
struct QueueInner {
    channels: HashMap<String, ChannelQueueState>,
    total_started: u64,
    total_queued: u64,
    total_handed_off: u64,
}

/// 按频道串行化的任务队列
#[derive(Debug, Default)]
pub struct ChannelTaskQueue {
    inner: Mutex<QueueInner>,
}

impl ChannelTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // 锁内只有簿记操作，中毒时状态仍然一致
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 频道空闲则放行，否则排队
    pub fn try_acquire(&self, mut request: QueuedRequest) -> Acquire {
        let mut inner = self.lock();
        let channel_id = request.channel_id.clone();
        let state = inner.channels.entry(channel_id.clone()).or_default();

        if state.active.is_none() {
            request.position = 0;
            tracing::debug!(channel = %channel_id, request = %request.id, "channel idle, starting request");
            state.active = Some(request);
            inner.total_started += 1;
            return Acquire::Go;
        }

        let position = state.queue.len() + 1;
        request.position = position;
        tracing::debug!(channel = %channel_id, request = %request.id, position, "channel busy, request queued");
        state.queue.push_back(request);
        inner.total_queued += 1;
        Acquire::Queued { position }
    }

    /// 当前请求结束：返回下一个要处理的请求（已置为活跃），或清除活跃标记
    pub fn release(&self, channel_id: &str) -> Option<QueuedRequest> {
        let mut inner = self.lock();
        let state = inner.channels.get_mut(channel_id)?;

        match state.queue.pop_front() {
            Some(next) => {
                state.active = Some(next.clone());
                inner.total_handed_off += 1;
                tracing::debug!(channel = %channel_id, request = %next.id, "handing off to queued request");
                Some(next)
            }
            None => {
                inner.channels.remove(channel_id);
                None
            }
        }
    }

    pub fn queue_len(&self, channel_id: &str) -> usize {
        self.lock()
            .channels
            .get(channel_id)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        self.lock()
            .channels
            .get(channel_id)
            .is_some_and(|s| s.active.is_some())
    }

    pub fn active_request(&self, channel_id: &str) -> Option<QueuedRequest> {
        self.lock()
            .channels
            .get(channel_id)
            .and_then(|s| s.active.clone())
    }

    /// 排队中的请求（按到达顺序）
    pub fn queued_requests(&self, channel_id: &str) -> Vec<QueuedRequest> {
        self.lock()
            .channels
            .get(channel_id)
            .map(|s| s.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            active_channels: inner
                .channels
                .values()
                .filter(|s| s.active.is_some())
                .count(),
            queued_requests: inner.channels.values().map(|s| s.queue.len()).sum(),
            total_started: inner.total_started,
            total_queued: inner.total_queued,
            total_handed_off: inner.total_handed_off,
        }
    }
}
