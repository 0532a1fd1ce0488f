//! 记忆抽取工作池
//!
//! 流水线回复后把 (上下文, 回复) 投递到有界队列，由固定数量的 worker 调用 MemoryExtractor。
//! 失败按 max_attempts 重试（至少一次投递），panic 视为失败；所有结果计入原子计数器。
//! 队列满时丢弃并计数，不阻塞流水线。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MemorySection;
use crate::core::panic_message;
use crate::gateway::PipelineContext;

/// 记忆抽取协作者（由宿主实现，如写入长期记忆库）
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(&self, ctx: &PipelineContext, response: &str) -> anyhow::Result<()>;
}

/// 只写日志的抽取器（本地运行用）
#[derive(Debug, Default)]
pub struct LogExtractor;

#[async_trait]
impl MemoryExtractor for LogExtractor {
    async fn extract(&self, ctx: &PipelineContext, response: &str) -> anyhow::Result<()> {
        tracing::info!(
            user = %ctx.user_id,
            channel = %ctx.channel_id,
            message_chars = ctx.message.chars().count(),
            response_chars = response.chars().count(),
            "memory extraction"
        );
        Ok(())
    }
}

struct ExtractionJob {
    ctx: Arc<PipelineContext>,
    response: String,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
}

/// 工作池统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPoolStats {
    pub submitted: u64,
    pub succeeded: u64,
    /// 重试耗尽后仍失败
    pub failed: u64,
    pub retried: u64,
    /// 队列满或已关闭时被丢弃
    pub dropped: u64,
    pub in_flight: u64,
}

const RETRY_BACKOFF_MS: u64 = 50;

/// 有界记忆抽取工作池
pub struct MemoryWorkerPool {
    tx: mpsc::Sender<ExtractionJob>,
    metrics: Arc<PoolMetrics>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryWorkerPool {
    /// 启动工作池（需在 tokio 运行时内调用）
    pub fn start(extractor: Arc<dyn MemoryExtractor>, section: &MemorySection) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExtractionJob>(section.queue_capacity.max(1));
        let metrics = Arc::new(PoolMetrics::default());
        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(section.workers.max(1)));
        let max_attempts = section.max_attempts.max(1);

        let dispatcher = {
            let metrics = Arc::clone(&metrics);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = cancel.cancelled() => break,
                        job = rx.recv() => match job {
                            Some(job) => job,
                            None => break,
                        },
                    };
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    let extractor = Arc::clone(&extractor);
                    let metrics = Arc::clone(&metrics);
                    tokio::spawn(async move {
                        let _permit = permit;
                        run_job(extractor.as_ref(), &job, max_attempts, &metrics).await;
                        metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                // 关闭后仍在队列里的任务计为丢弃
                rx.close();
                while rx.recv().await.is_some() {
                    metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!("memory worker pool dispatcher stopped");
            })
        };

        Self {
            tx,
            metrics,
            cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// 非阻塞投递；队列满或已关闭时返回 false
    pub fn submit(&self, ctx: Arc<PipelineContext>, response: String) -> bool {
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        self.metrics.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(ExtractionJob { ctx, response }) {
            Ok(()) => true,
            Err(e) => {
                self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "pool stopped",
                };
                tracing::warn!(reason, "memory extraction job dropped");
                false
            }
        }
    }

    pub fn stats(&self) -> MemoryPoolStats {
        let m = &self.metrics;
        MemoryPoolStats {
            submitted: m.submitted.load(Ordering::Relaxed),
            succeeded: m.succeeded.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            retried: m.retried.load(Ordering::Relaxed),
            dropped: m.dropped.load(Ordering::Relaxed),
            in_flight: m.in_flight.load(Ordering::SeqCst),
        }
    }

    /// 等待所有已投递任务完成；超时返回 false
    pub async fn flush(&self, timeout: Duration) -> bool {
        let wait = async {
            while self.metrics.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// 等待在途任务（最多 grace）后停止分发
    pub async fn shutdown(&self, grace: Duration) {
        if !self.flush(grace).await {
            tracing::warn!(in_flight = self.stats().in_flight, "memory pool shutdown with jobs in flight");
        }
        self.cancel.cancel();
        let handle = self.dispatcher.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for MemoryWorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_job(
    extractor: &dyn MemoryExtractor,
    job: &ExtractionJob,
    max_attempts: u32,
    metrics: &PoolMetrics,
) {
    for attempt in 1..=max_attempts {
        let outcome = AssertUnwindSafe(extractor.extract(&job.ctx, &job.response))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => {
                metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        if attempt < max_attempts {
            metrics.retried.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(attempt, error = %error, "memory extraction failed, retrying");
            tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
        } else {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                attempts = max_attempts,
                user = %job.ctx.user_id,
                error = %error,
                "memory extraction failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// 前 fail_first 次失败，之后成功
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MemoryExtractor for Flaky {
        async fn extract(&self, _ctx: &PipelineContext, _response: &str) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient failure {}", n);
            }
            Ok(())
        }
    }

    struct Panicky;

    #[async_trait]
    impl MemoryExtractor for Panicky {
        async fn extract(&self, _ctx: &PipelineContext, _response: &str) -> anyhow::Result<()> {
            panic!("extractor blew up");
        }
    }

    fn ctx() -> Arc<PipelineContext> {
        Arc::new(PipelineContext::new("remember this", "u1", "c1"))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let extractor = Arc::new(Flaky {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let pool = MemoryWorkerPool::start(extractor.clone(), &MemorySection::default());
        assert!(pool.submit(ctx(), "ok".to_string()));
        assert!(pool.flush(Duration::from_secs(5)).await);

        let stats = pool.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_count_as_failed() {
        let extractor = Arc::new(Flaky {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let section = MemorySection {
            max_attempts: 2,
            ..Default::default()
        };
        let pool = MemoryWorkerPool::start(extractor, &section);
        pool.submit(ctx(), "x".to_string());
        assert!(pool.flush(Duration::from_secs(5)).await);
        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let section = MemorySection {
            max_attempts: 1,
            ..Default::default()
        };
        let pool = MemoryWorkerPool::start(Arc::new(Panicky), &section);
        pool.submit(ctx(), "x".to_string());
        assert!(pool.flush(Duration::from_secs(5)).await);
        assert_eq!(pool.stats().failed, 1);

        // 池仍然可用
        pool.submit(ctx(), "y".to_string());
        assert!(pool.flush(Duration::from_secs(5)).await);
        assert_eq!(pool.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let pool = MemoryWorkerPool::start(Arc::new(LogExtractor), &MemorySection::default());
        pool.shutdown(Duration::from_secs(1)).await;
        assert!(!pool.submit(ctx(), "late".to_string()));
        assert_eq!(pool.stats().dropped, 1);
    }
}
