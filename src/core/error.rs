//! 编排核心的错误类型
//!
//! 注册冲突与模块加载失败只影响单个工具模块；流水线错误最终折叠进 PipelineResult.error，不向调用方抛出。

use std::path::PathBuf;

use thiserror::Error;

/// 工具注册表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// 同名工具已被另一个模块注册（同一模块重复注册视为热重载覆盖，不报错）
    #[error("Tool '{name}' already registered by '{owner}'")]
    Conflict { name: String, owner: String },
}

/// 工具模块加载错误（每个模块独立，互不影响）
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest for module {module}: {reason}")]
    InvalidManifest { module: String, reason: String },

    #[error("Module {0} exports no tools")]
    NoTools(String),

    #[error("Module {module} exports tool {name} more than once")]
    DuplicateTool { module: String, name: String },

    #[error("Module {module} initialize failed: {reason}")]
    Initialize { module: String, reason: String },

    #[error("Module {0} panicked while loading")]
    Panicked(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Watcher error: {0}")]
    Watch(String),
}

/// 流水线阶段错误
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No response generator configured")]
    NoGenerator,

    #[error("Response generation failed: {0}")]
    Generation(String),

    #[error("Stage {0} panicked")]
    Panicked(&'static str),
}

/// 从 catch_unwind 的 payload 中取出可读信息
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
