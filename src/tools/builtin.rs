//! 内置工具模块（编译进二进制）

use std::fmt::Write;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::module::ToolModule;
use super::registry::{handler_fn, ToolDefinition};

/// 内置核心模块：echo 与 time_now
#[derive(Debug, Default)]
pub struct CoreModule;

async fn echo(args: Value) -> anyhow::Result<String> {
    let text = args
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("(empty)");
    Ok(text.to_string())
}

async fn time_now(args: Value) -> anyhow::Result<String> {
    let now = chrono::Utc::now();
    match args.get("format").and_then(|v| v.as_str()) {
        Some(fmt) if !fmt.is_empty() => {
            let mut out = String::new();
            write!(out, "{}", now.format(fmt)).map_err(|_| anyhow!("invalid time format: {}", fmt))?;
            Ok(out)
        }
        _ => Ok(now.to_rfc3339()),
    }
}

#[async_trait]
impl ToolModule for CoreModule {
    fn name(&self) -> &str {
        "core"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn system_prompt(&self) -> Option<String> {
        Some("Use `time_now` for the current UTC time; `echo` repeats text back.".to_string())
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "echo",
                "Echo text back (for testing).",
                handler_fn(|args, _ctx| echo(args)),
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to echo"}},
                "required": ["text"]
            })),
            ToolDefinition::new(
                "time_now",
                "Current UTC time, RFC 3339 unless a strftime format is given.",
                handler_fn(|args, _ctx| time_now(args)),
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {"format": {"type": "string", "description": "strftime format"}},
                "required": []
            })),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;

    #[tokio::test]
    async fn test_core_tools() {
        let tools = CoreModule.tools();
        assert_eq!(tools.len(), 2);
        let ctx = ToolContext::default();
        let out = tools[0].handler.call(&json!({"text": "hey"}), &ctx).await.unwrap();
        assert_eq!(out, "hey");
        let year = tools[1]
            .handler
            .call(&json!({"format": "%Y"}), &ctx)
            .await
            .unwrap();
        assert_eq!(year.len(), 4);
    }
}
