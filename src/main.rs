//! Parley - 本地演示入口
//!
//! 初始化日志与配置，加载工具模块（可选热重载），用 Mock 模型搭好流水线，
//! 然后从 stdin 逐行读取 `<channel> <user> <text>` 送入频道运行时并打印回复。
//! 以 `dm` 开头的频道视为私聊。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parley::config::load_config;
use parley::gateway::{tier_display, ChannelRuntime, Dispatch, InboundMessage, MessagePipeline};
use parley::llm::{LlmClient, MockLlmClient};
use parley::memory::{LogExtractor, MemoryWorkerPool};
use parley::observability;
use parley::react::ToolLoopGenerator;
use parley::tools::{CoreModule, ToolLoader, ToolRegistry};
use tokio::io::{AsyncBufReadExt, BufReader};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let _ = std::fs::create_dir_all(cfg.app.workspace());

    // 工具：内置模块 + 目录中的清单模块
    let registry = Arc::new(ToolRegistry::new());
    let loader = Arc::new(ToolLoader::from_config(Arc::clone(&registry), &cfg));
    loader.load_builtin(Arc::new(CoreModule)).await;
    let loaded = loader.load_all().await;
    loader.on_reload(|module, ok| tracing::info!(module, success = ok, "tool module reload finished"));
    if cfg.tools.hot_reload {
        if let Err(e) = loader.start_watching() {
            tracing::warn!(error = %e, "hot reload disabled");
        }
    }
    tracing::info!(
        modules = loaded,
        tools = registry.len().await,
        dir = %cfg.tools.dir.display(),
        "tools ready"
    );

    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient);
    let generator = ToolLoopGenerator::from_config(Arc::clone(&llm), Arc::clone(&registry), &cfg);
    let memory = Arc::new(MemoryWorkerPool::start(Arc::new(LogExtractor), &cfg.memory));
    let pipeline = MessagePipeline::from_config(&cfg, Some(llm))
        .with_generator(Arc::new(generator))
        .with_memory_pool(Arc::clone(&memory));
    let (runtime, mut replies) = ChannelRuntime::from_config(&cfg, Arc::new(pipeline));
    runtime
        .sessions()
        .start_sweeper(Duration::from_secs(cfg.session.cleanup_interval_secs.max(1)));

    let printer = tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            let (emoji, label) = tier_display(reply.result.tier);
            match &reply.result.error {
                None => println!(
                    "[{}] @{} {} {}: {}",
                    reply.channel_id, reply.user_id, emoji, label, reply.result.response
                ),
                Some(error) => println!("[{}] @{} error: {}", reply.channel_id, reply.user_id, error),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let mut parts = line.trim().splitn(3, ' ');
        let (Some(channel), Some(user), Some(text)) = (parts.next(), parts.next(), parts.next()) else {
            if !line.trim().is_empty() {
                eprintln!("usage: <channel> <user> <text>");
            }
            continue;
        };

        let mut msg = InboundMessage::new(channel, user, text);
        msg.is_dm = channel.starts_with("dm");
        match runtime.handle(msg).await {
            Dispatch::Rejected(verdict) => {
                println!("[{}] (no reply: {} - {})", channel, verdict.code.as_str(), verdict.reason)
            }
            Dispatch::Queued { position, .. } => println!("[{}] queued at #{}", channel, position),
            Dispatch::Started { .. } => {}
        }
    }

    // stdin 结束：等待各频道排空
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while runtime.queue().stats().active_channels > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("shutting down with requests still in flight");
    }

    runtime.sessions().stop_sweeper();
    memory.shutdown(Duration::from_secs(5)).await;
    loader.shutdown().await;
    drop(runtime);
    let _ = printer.await;
    Ok(())
}
