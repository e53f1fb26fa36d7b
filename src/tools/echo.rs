//! echo：原样返回 `text`，用于联调与握手后的连通性检查

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return `text` unchanged."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        match args.get("text") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err("missing argument 'text'".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo() {
        assert_eq!(EchoTool.execute(json!({"text": "oi"})).await.unwrap(), "oi");
        assert_eq!(EchoTool.execute(json!({"text": 3})).await.unwrap(), "3");
        assert!(EchoTool.execute(json!({})).await.is_err());
    }
}
