//! 供应进程协议：按行分隔的 JSON 帧
//!
//! 请求 `{"id", "method": "list_tools" | "call_tool", "params"}` 写入子进程 stdin；
//! 响应 `{"id", "result" | "error"}` 从 stdout 读取，按 id 与请求配对。
//! 启动后子进程先输出 `{"event": "ready"}` 表示就绪。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 未知工具/方法的错误码（映射为 ToolNotFound）
pub const TOOL_NOT_FOUND: i64 = -32601;
/// 参数错误
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    ListTools,
    CallTool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: Method,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResponseFrame {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

/// `call_tool` 的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// `call_tool` 的结果体；content 缺失时由调用方决定如何降级
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// 工具描述（list_tools 的返回项），对调用方只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// 一次工具调用的结果，按 call_id 与请求对应
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResponse {
    pub call_id: u64,
    pub content: Value,
    pub is_error: bool,
}

impl ToolCallResponse {
    /// 文本形式：字符串原样返回，其余 JSON 序列化
    pub fn text(&self) -> String {
        value_text(&self.content)
    }
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// stdout 上一行的分类结果
#[derive(Debug)]
pub enum Incoming {
    Ready,
    Response(ResponseFrame),
    /// 带 id 但结构不合法的响应，对应调用以 MalformedResponse 结束
    Malformed { id: u64, reason: String },
    /// 非协议输出（启动日志等），跳过
    Other,
}

/// 解析一行输出；带 id 的 JSON 对象一律视为响应（是否缺字段由分发方判断）
pub fn parse_incoming(line: &str) -> Incoming {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Incoming::Other;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return Incoming::Other,
    };
    if value.get("event").and_then(Value::as_str) == Some("ready") {
        return Incoming::Ready;
    }
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        return Incoming::Other;
    };
    match serde_json::from_value::<ResponseFrame>(value) {
        Ok(frame) => Incoming::Response(frame),
        Err(e) => Incoming::Malformed {
            id,
            reason: format!("invalid response frame: {}", e),
        },
    }
}

/// 序列化为一行（带换行）
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    Ok(serde_json::to_string(frame)? + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = RequestFrame {
            id: 7,
            method: Method::CallTool,
            params: json!({"name": "echo", "arguments": {"text": "oi"}}),
        };
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"method\":\"call_tool\""));
        assert!(line.contains("\"id\":7"));
    }

    #[test]
    fn test_parse_ready_and_noise() {
        assert!(matches!(parse_incoming(r#"{"event":"ready","name":"x"}"#), Incoming::Ready));
        assert!(matches!(parse_incoming("starting server..."), Incoming::Other));
        assert!(matches!(parse_incoming(""), Incoming::Other));
        assert!(matches!(parse_incoming(r#"{"log":"hi"}"#), Incoming::Other));
    }

    #[test]
    fn test_parse_error_response() {
        let line = r#"{"id":3,"error":{"code":-32601,"message":"unknown tool"}}"#;
        match parse_incoming(line) {
            Incoming::Response(frame) => {
                assert_eq!(frame.id, 3);
                assert!(frame.result.is_none());
                assert_eq!(frame.error.unwrap().code, TOOL_NOT_FOUND);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_without_payload_is_still_response() {
        match parse_incoming(r#"{"id":9}"#) {
            Incoming::Response(frame) => {
                assert!(frame.result.is_none() && frame.error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_bad_body_with_id_is_malformed() {
        match parse_incoming(r#"{"id":11,"error":"boom"}"#) {
            Incoming::Malformed { id, reason } => {
                assert_eq!(id, 11);
                assert!(reason.contains("invalid response frame"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_result_defaults() {
        let r: CallToolResult = serde_json::from_value(json!({})).unwrap();
        assert!(r.content.is_none());
        assert!(!r.is_error);

        let d: ToolDescriptor = serde_json::from_value(json!({"name": "echo"})).unwrap();
        assert_eq!(d.input_schema["type"], "object");
    }
}
