//! 工具模块：可热重载的最小单元
//!
//! 一个模块导出一组工具、可选的 prompt 片段，以及可选的 initialize / cleanup 生命周期钩子。
//! 磁盘上的清单模块（见 manifest）与编译进二进制的内置模块都实现这个 trait。

use async_trait::async_trait;

use super::registry::ToolDefinition;

#[async_trait]
pub trait ToolModule: Send + Sync {
    /// 模块名（内置模块以此作为模块 id）
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// 拼入 system prompt 的片段
    fn system_prompt(&self) -> Option<String> {
        None
    }

    /// 导出的工具，必须非空
    fn tools(&self) -> Vec<ToolDefinition>;

    /// 注册前调用，失败则模块不会被注册
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 卸载或被新版本替换前调用，失败只记录日志
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
