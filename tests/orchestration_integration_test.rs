//! 编排集成测试：工具加载 + 注册表 + 流水线 + 会话级队列

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley::config::{MemorySection, SessionSection};
use parley::gateway::{
    ChannelRuntime, ChannelTaskQueue, Dispatch, GeneratedResponse, GroupSessionCache, InboundMessage,
    IntentDetector, MessagePipeline, PipelineContext, RejectionClassifier, Reply, ResponseGenerator,
    TierSelector,
};
use parley::llm::ScriptedLlmClient;
use parley::memory::{LogExtractor, MemoryWorkerPool, Role};
use parley::react::ToolLoopGenerator;
use parley::tools::{handler_fn, ToolContext, ToolDefinition, ToolLoader, ToolModule, ToolRegistry};
use serde_json::json;
use tokio::sync::mpsc;

fn build_runtime(
    generator: Arc<dyn ResponseGenerator>,
) -> (Arc<ChannelRuntime>, mpsc::UnboundedReceiver<Reply>) {
    let pipeline = MessagePipeline::new(IntentDetector::default(), TierSelector::default())
        .with_generator(generator);
    ChannelRuntime::new(
        Arc::new(pipeline),
        Arc::new(RejectionClassifier::default()),
        Arc::new(GroupSessionCache::new(&SessionSection::default())),
        Arc::new(ChannelTaskQueue::new()),
    )
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Reply>) -> Reply {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("reply in time")
        .expect("reply channel open")
}

#[cfg(unix)]
#[tokio::test]
async fn test_manifest_tool_used_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("shout.toml"),
        r#"
            version = "1.0.0"
            system_prompt = "Use `shout` to repeat text loudly."

            [[tools]]
            name = "shout"
            description = "Repeat text"
            program = "echo"
            args = ["{{text}}!"]

            [tools.parameters]
            type = "object"
            required = ["text"]

            [tools.parameters.properties.text]
            type = "string"
        "#,
    )
    .unwrap();

    let registry = Arc::new(ToolRegistry::new());
    let loader = ToolLoader::new(Arc::clone(&registry), dir.path()).with_workspace(dir.path());
    assert_eq!(loader.load_all().await, 1);

    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"tool": "shout", "args": {"text": "hello"}}"#,
        "I shouted hello for you.",
    ]));
    let generator = ToolLoopGenerator::new(llm.clone(), Arc::clone(&registry)).with_workspace(dir.path());
    let memory = Arc::new(MemoryWorkerPool::start(Arc::new(LogExtractor), &MemorySection::default()));
    let pipeline = MessagePipeline::new(IntentDetector::default(), TierSelector::default())
        .with_generator(Arc::new(generator))
        .with_memory_pool(Arc::clone(&memory));
    let (runtime, mut rx) = ChannelRuntime::new(
        Arc::new(pipeline),
        Arc::new(RejectionClassifier::default()),
        Arc::new(GroupSessionCache::new(&SessionSection::default())),
        Arc::new(ChannelTaskQueue::new()),
    );

    runtime
        .handle(InboundMessage::new("dm-1", "u1", "please shout hello").direct())
        .await;
    let reply = recv(&mut rx).await;
    assert!(reply.result.success(), "{:?}", reply.result.error);
    assert_eq!(reply.result.response, "I shouted hello for you.");
    assert_eq!(reply.result.tools_used, vec!["shout"]);

    let first_call = llm.call(0).unwrap();
    assert!(first_call[0].content.contains("Use `shout` to repeat text loudly."));
    let observation = llm.call(1).unwrap().last().cloned().unwrap();
    assert_eq!(observation.role, Role::Tool);
    assert_eq!(observation.content, "[shout] hello!");

    assert!(memory.flush(Duration::from_secs(5)).await);
    assert_eq!(memory.stats().succeeded, 1);
}

/// 内置模块：greet 返回自身版本号
struct Versioned(&'static str);

#[async_trait]
impl ToolModule for Versioned {
    fn name(&self) -> &str {
        "greeter"
    }

    fn version(&self) -> &str {
        self.0
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let version = self.0;
        vec![ToolDefinition::new(
            "greet",
            "Say hi",
            handler_fn(move |_args, _ctx| async move {
                tokio::task::yield_now().await;
                Ok::<_, anyhow::Error>(version.to_string())
            }),
        )]
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hot_swap_never_exposes_missing_tool() {
    let registry = Arc::new(ToolRegistry::new());
    let loader = Arc::new(ToolLoader::new(Arc::clone(&registry), "does-not-exist"));
    assert!(loader.load_builtin(Arc::new(Versioned("1"))).await);

    let mut callers = Vec::new();
    for _ in 0..4 {
        let registry = Arc::clone(&registry);
        callers.push(tokio::spawn(async move {
            let ctx = ToolContext::new("u", "c");
            let mut outputs = Vec::new();
            for _ in 0..200 {
                outputs.push(registry.execute("greet", json!({}), &ctx).await);
            }
            outputs
        }));
    }

    for round in 0..50 {
        let version = if round % 2 == 0 { "2" } else { "1" };
        assert!(loader.load_builtin(Arc::new(Versioned(version))).await);
    }

    for caller in callers {
        for output in caller.await.unwrap() {
            assert!(output == "1" || output == "2", "unexpected output {}", output);
        }
    }
    assert_eq!(registry.tools_by_module("greeter").await, vec!["greet"]);
}

/// 记录处理顺序的生成器
#[derive(Default)]
struct OrderRecorder {
    order: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ResponseGenerator for OrderRecorder {
    async fn generate(&self, ctx: &PipelineContext) -> anyhow::Result<GeneratedResponse> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.order
            .lock()
            .unwrap()
            .push((ctx.channel_id.clone(), ctx.message.clone()));
        Ok(GeneratedResponse::text(format!("done {}", ctx.message)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channels_serialized_independently() {
    let recorder = Arc::new(OrderRecorder::default());
    let (runtime, mut rx) = build_runtime(recorder.clone());

    for i in 0..4 {
        for channel in ["dm-a", "dm-b"] {
            runtime
                .handle(InboundMessage::new(channel, "u1", format!("{} msg {}", channel, i)).direct())
                .await;
        }
    }
    for _ in 0..8 {
        recv(&mut rx).await;
    }

    let order = recorder.order.lock().unwrap().clone();
    for channel in ["dm-a", "dm-b"] {
        let seen: Vec<&str> = order
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.as_str())
            .collect();
        let expected: Vec<String> = (0..4).map(|i| format!("{} msg {}", channel, i)).collect();
        assert_eq!(seen, expected);
    }

    // 回复先于 release 发出，等待频道空闲
    for _ in 0..100 {
        if runtime.queue().stats().active_channels == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = runtime.queue().stats();
    assert_eq!(stats.active_channels, 0);
    assert_eq!(stats.queued_requests, 0);
    assert_eq!(stats.total_started + stats.total_handed_off, 8);
}

#[tokio::test]
async fn test_group_chat_admission() {
    let recorder = Arc::new(OrderRecorder::default());
    let (runtime, mut rx) = build_runtime(recorder.clone());

    let ambient = runtime.handle(InboundMessage::new("group", "u1", "lol same")).await;
    assert!(matches!(ambient, Dispatch::Rejected(_)));

    let addressed = runtime
        .handle(InboundMessage::new("group", "u2", "hey clarissa, what's 2+2?"))
        .await;
    assert!(matches!(addressed, Dispatch::Started { .. }));
    let reply = recv(&mut rx).await;
    assert_eq!(reply.result.response, "done hey clarissa, what's 2+2?");
    assert_eq!(recorder.order.lock().unwrap().len(), 1);
}
