//! dealer-provider：参考工具供应进程
//!
//! 通过 stdin/stdout 按行收发 JSON 帧：启动后输出 `{"event":"ready"}`，之后并发处理
//! list_tools / call_tool 请求。stdout 只写协议帧，日志写 stderr。stdin 结束即退出。
//!
//! 环境变量：
//! - `DEALER_PROVIDER_READY_DELAY_MS`：延迟输出就绪帧（用于握手超时测试）
//! - `DEALER_PROVIDER_NAME`：就绪帧中的名称

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dealer::supervisor::protocol::{
    encode_line, CallToolParams, CallToolResult, ListToolsResult, Method, RequestFrame,
    ResponseFrame, INVALID_PARAMS, TOOL_NOT_FOUND,
};
use dealer::tools::{CrashTool, DelayTool, EchoTool, ToolRegistry};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

type SharedStdout = Arc<Mutex<Stdout>>;

fn registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(DelayTool);
    tools.register(CrashTool);
    tools
}

async fn write_frame<T: serde::Serialize>(out: &SharedStdout, frame: &T) -> anyhow::Result<()> {
    let line = encode_line(frame)?;
    let mut out = out.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

async fn handle(tools: &ToolRegistry, request: RequestFrame) -> ResponseFrame {
    let id = request.id;
    match request.method {
        Method::ListTools => {
            let result = ListToolsResult {
                tools: tools.descriptors(),
            };
            match serde_json::to_value(result) {
                Ok(v) => ResponseFrame::ok(id, v),
                Err(e) => ResponseFrame::err(id, INVALID_PARAMS, e.to_string()),
            }
        }
        Method::CallTool => {
            let params: CallToolParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return ResponseFrame::err(id, INVALID_PARAMS, format!("invalid params: {}", e)),
            };
            let Some(tool) = tools.get(&params.name) else {
                return ResponseFrame::err(id, TOOL_NOT_FOUND, format!("unknown tool: {}", params.name));
            };
            tracing::debug!(id, tool = %params.name, "call_tool");
            let result = match tool.execute(params.arguments).await {
                Ok(text) => CallToolResult {
                    content: Some(Value::String(text)),
                    is_error: false,
                },
                Err(message) => CallToolResult {
                    content: Some(Value::String(message)),
                    is_error: true,
                },
            };
            match serde_json::to_value(result) {
                Ok(v) => ResponseFrame::ok(id, v),
                Err(e) => ResponseFrame::err(id, INVALID_PARAMS, e.to_string()),
            }
        }
    }
}

/// 解析请求行；无法识别的方法按 TOOL_NOT_FOUND 回复，没有 id 的行忽略
fn parse_request(line: &str) -> Result<RequestFrame, Option<ResponseFrame>> {
    let value: Value = serde_json::from_str(line).map_err(|_| None)?;
    let id = value.get("id").and_then(Value::as_u64).ok_or(None)?;
    serde_json::from_value::<RequestFrame>(value.clone()).map_err(|e| {
        let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
        Some(if method.is_empty() {
            ResponseFrame::err(id, INVALID_PARAMS, e.to_string())
        } else {
            ResponseFrame::err(id, TOOL_NOT_FOUND, format!("unknown method: {}", method))
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dealer::observability::init_stderr();

    let name = std::env::var("DEALER_PROVIDER_NAME").unwrap_or_else(|_| "dealer-provider".to_string());
    let ready_delay = std::env::var("DEALER_PROVIDER_READY_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let tools = Arc::new(registry());
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));

    if ready_delay > 0 {
        tokio::time::sleep(Duration::from_millis(ready_delay)).await;
    }
    write_frame(&stdout, &json!({ "event": "ready", "name": name }))
        .await
        .context("Failed to write ready frame")?;
    tracing::info!(name = %name, tools = tools.len(), "provider ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let request = match parse_request(&line) {
            Ok(r) => r,
            Err(Some(reply)) => {
                write_frame(&stdout, &reply).await?;
                continue;
            }
            Err(None) => {
                tracing::debug!(line = %line, "ignoring non-request line");
                continue;
            }
        };

        let tools = tools.clone();
        let stdout = stdout.clone();
        tokio::spawn(async move {
            let response = handle(&tools, request).await;
            if let Err(e) = write_frame(&stdout, &response).await {
                tracing::warn!(error = %e, "failed to write response");
            }
        });
    }

    tracing::info!(name = %name, "stdin closed, exiting");
    Ok(())
}
