//! 模型调用抽象（编排核心只依赖这一个 trait，具体后端由宿主注入）
//!
//! 意图二次判定、工具循环的回复生成都通过 LlmClient::complete 调用模型。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，失败时返回可读错误信息
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }
}
