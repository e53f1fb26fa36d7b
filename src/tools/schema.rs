//! 工具调用 JSON Schema 生成（schemars 自动生成）
//!
//! 注入 Agent 阶段的 system prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 单个工具调用：与 planner 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 search_manual、search_catalog、get_ga4_realtime_users
    pub tool: String,
    /// 工具参数（JSON 对象，依工具的 inputSchema 而定）
    pub args: Value,
}

/// 同一步内的多个独立调用
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallBatchFormat {
    pub tool_calls: Vec<ToolCallFormat>,
}

/// 返回单个工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 返回批量工具调用的 JSON Schema 字符串
pub fn tool_call_batch_schema_json() -> String {
    let schema = schema_for!(ToolCallBatchFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_fields() {
        let single = tool_call_schema_json();
        assert!(single.contains("\"tool\""));
        assert!(single.contains("\"args\""));
        assert!(tool_call_batch_schema_json().contains("tool_calls"));
    }
}
