//! Tool Call 解析
//!
//! 从模型输出中提取 JSON（```json ... ``` 代码块或首个 `{` 到末个 `}`），解析为 ToolCall；
//! 无 JSON、JSON 不合法或 tool 为空时视为直接回复。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 模型请求的工具调用：{"tool": "time_now", "args": {"format": "%H:%M"}}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复用户
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// args 统一为对象：缺省为空对象，字符串形式的 JSON 先解析，解析失败同样视为空对象
fn normalize_args(args: Value) -> Value {
    match args {
        Value::Object(_) => args,
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::Object(Default::default()),
        },
        _ => Value::Object(Default::default()),
    }
}

/// 解析模型输出
pub fn parse_llm_output(output: &str) -> PlannerOutput {
    let trimmed = output.trim();
    let Some(json_str) = extract_json(trimmed) else {
        return PlannerOutput::Response(trimmed.to_string());
    };

    match serde_json::from_str::<ToolCall>(json_str) {
        Ok(call) if !call.tool.trim().is_empty() => PlannerOutput::ToolCall(ToolCall {
            tool: call.tool.trim().to_string(),
            args: normalize_args(call.args),
        }),
        Ok(_) => PlannerOutput::Response(trimmed.to_string()),
        Err(e) => {
            tracing::debug!(error = %e, "model output is not a tool call");
            PlannerOutput::Response(trimmed.to_string())
        }
    }
}
