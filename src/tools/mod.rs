//! 工具层：注册表、工具模块与热重载加载器
//!
//! - registry：ToolDefinition / ToolRegistry（执行时把错误与 panic 转成字符串）
//! - module / manifest / plugin：模块契约、TOML 清单模块与进程型处理器
//! - loader / watcher：目录扫描、变更检测与热重载
//! - builtin：编译进二进制的核心模块

pub mod builtin;
pub mod loader;
pub mod manifest;
pub mod module;
pub mod plugin;
pub mod registry;
pub mod schema;
pub mod watcher;

pub use builtin::CoreModule;
pub use loader::{module_id_for_path, ModuleMarker, ReloadCallback, ToolLoader};
pub use manifest::{HookCommand, ManifestModule, ModuleManifest, ToolManifest, MODULE_MANIFEST};
pub use module::ToolModule;
pub use plugin::{run_command, CommandHandler};
pub use registry::{handler_fn, FnHandler, ToolContext, ToolDefinition, ToolHandler, ToolRegistry};
pub use schema::tool_call_schema_json;
pub use watcher::ToolWatcher;
