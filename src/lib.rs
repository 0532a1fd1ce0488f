//! Parley - 对话助手编排核心
//!
//! 对每条入站消息决定：要不要回复（准入判定）、用哪一档模型、能用哪些工具、
//! 以及与同一会话中其他请求的先后顺序。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **gateway**: 准入判定、意图识别、档位选择、群聊上下文、会话级队列、消息流水线与频道运行时
//! - **llm**: 模型调用抽象与 Mock 实现
//! - **memory**: 对话消息与记忆抽取工作池
//! - **observability**: tracing 初始化
//! - **react**: Tool Call 解析与工具调用循环
//! - **tools**: 工具注册表、工具模块与热重载加载器

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use config::{load_config, AppConfig};
pub use gateway::{ChannelRuntime, MessagePipeline, PipelineResult};
pub use tools::{ToolLoader, ToolRegistry};
