//! 诊断工具：延迟回显与进程崩溃，用于验证超时、并发与进程退出路径

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 延迟工具：等待 `ms` 毫秒后回显 `text`
pub struct DelayTool;

#[async_trait]
impl Tool for DelayTool {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Sleep for `ms` milliseconds, then echo `text`."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "ms": { "type": "integer", "minimum": 0 },
                "text": { "type": "string" }
            },
            "required": ["ms"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let ms = args
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing integer argument 'ms'".to_string())?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

/// 崩溃工具：立即以退出码 1 结束当前进程（仅供供应进程内使用）
pub struct CrashTool;

#[async_trait]
impl Tool for CrashTool {
    fn name(&self) -> &str {
        "crash"
    }

    fn description(&self) -> &str {
        "Terminate the provider process immediately (exit code 1)."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tracing::warn!("crash tool invoked, exiting");
        std::process::exit(1);
    }
}
