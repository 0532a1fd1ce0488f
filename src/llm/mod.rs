//! LLM 层：模型调用抽象与 Mock 实现

pub mod mock;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use traits::LlmClient;
