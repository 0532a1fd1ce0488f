//! 工具调用 JSON Schema（schemars 自动生成）
//!
//! 拼入工具循环的 system prompt，约束模型输出 `{"tool": "...", "args": {...}}`。

use std::collections::BTreeMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用请求格式，与 react::parse_tool_call 解析的结构一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 已注册的工具名
    pub tool: String,
    /// 工具参数，需符合该工具的 parameters schema
    pub args: BTreeMap<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_fields() {
        let schema: Value = serde_json::from_str(&tool_call_schema_json()).unwrap();
        let props = &schema["properties"];
        assert!(props.get("tool").is_some());
        assert_eq!(props["args"]["type"], "object");
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"tool"));
    }
}
