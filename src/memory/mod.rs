//! 记忆层：对话消息类型与回复后的记忆抽取工作池

pub mod conversation;
pub mod extractor;

pub use conversation::{Message, Role};
pub use extractor::{LogExtractor, MemoryExtractor, MemoryPoolStats, MemoryWorkerPool};
