//! 供应进程监管器（Manager）
//!
//! 每个注册名至多一个存活连接。连接表用 RwLock 保护，同名初始化由按名的闸门串行化，
//! 不会重复拉起进程；不同名称可并行初始化。调用 ID 由单一计数器生成，在 Manager 内唯一。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::SupervisorSection;
use crate::core::SupervisorError;
use crate::supervisor::connection::{Connection, ServerStatus};
use crate::supervisor::protocol::{
    CallToolParams, CallToolResult, ListToolsResult, Method, ResponseFrame, ToolCallResponse,
    ToolDescriptor, TOOL_NOT_FOUND,
};
use crate::supervisor::{ServerConfig, ServerRegistry};
use crate::tools::ToolProvider;

/// 握手、调用、关闭的时间上限
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimeouts {
    pub startup: Duration,
    pub call: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(15),
            call: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl From<&SupervisorSection> for SupervisorTimeouts {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            startup: section.startup_timeout(),
            call: section.call_timeout(),
            shutdown_grace: section.shutdown_grace(),
        }
    }
}

pub struct Manager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_call_id: AtomicU64,
    timeouts: SupervisorTimeouts,
}

impl Manager {
    pub fn new(timeouts: SupervisorTimeouts) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            timeouts,
        }
    }

    fn gate(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(gates.entry(name.to_string()).or_default())
    }

    fn next_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 启动并握手。已 Ready 且配置相同则为空操作；配置不同返回 ConfigConflict；
    /// Failed / Stopped 的旧实例被回收后重新拉起新进程。
    pub async fn initialize(&self, name: &str, config: ServerConfig) -> Result<(), SupervisorError> {
        let config = ServerConfig {
            name: name.to_string(),
            ..config
        };
        let gate = self.gate(name);
        let _guard = gate.lock().await;

        let existing = self.connections.read().await.get(name).cloned();
        if let Some(existing) = existing {
            if existing.status() == ServerStatus::Ready {
                if existing.config() == &config {
                    tracing::debug!(server = %name, "already initialized");
                    return Ok(());
                }
                return Err(SupervisorError::ConfigConflict(name.to_string()));
            }
            tracing::info!(server = %name, status = ?existing.status(), "replacing dead provider instance");
            existing.shutdown(self.timeouts.shutdown_grace).await;
        }

        let conn = Connection::spawn(config)?;
        self.connections
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&conn));
        conn.handshake(self.timeouts.startup).await
    }

    /// 初始化注册表中所有服务；单个失败只记录，不影响其它服务
    pub async fn initialize_all(&self, registry: &ServerRegistry) -> Vec<(String, Result<(), SupervisorError>)> {
        let futures = registry.iter().map(|cfg| async move {
            let result = self.initialize(&cfg.name, cfg.clone()).await;
            if let Err(ref e) = result {
                tracing::warn!(server = %cfg.name, error = %e, "provider failed to initialize");
            }
            (cfg.name.clone(), result)
        });
        futures_util::future::join_all(futures).await
    }

    pub async fn status(&self, name: &str) -> Option<ServerStatus> {
        self.connections.read().await.get(name).map(|c| c.status())
    }

    async fn ready_connection(&self, name: &str) -> Result<Arc<Connection>, SupervisorError> {
        let conn = self
            .connections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::ServerNotInitialized(name.to_string()))?;
        if conn.status() != ServerStatus::Ready {
            return Err(SupervisorError::ServerNotInitialized(name.to_string()));
        }
        Ok(conn)
    }

    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, SupervisorError> {
        let conn = self.ready_connection(name).await?;
        let frame = conn
            .request(self.next_id(), Method::ListTools, json!({}), "list_tools", self.timeouts.call)
            .await?;
        if let Some(err) = frame.error {
            return Err(SupervisorError::MalformedResponse {
                server: name.to_string(),
                reason: format!("list_tools failed: {} ({})", err.message, err.code),
            });
        }
        let result = frame.result.unwrap_or(Value::Null);
        let listed: ListToolsResult = serde_json::from_value(result).map_err(|e| SupervisorError::MalformedResponse {
            server: name.to_string(),
            reason: format!("invalid list_tools result: {}", e),
        })?;
        Ok(listed.tools)
    }

    /// 调用工具；同一连接上的并发调用互不串行，响应严格按 call_id 对应
    pub async fn call_tool(&self, name: &str, tool: &str, arguments: Value) -> Result<ToolCallResponse, SupervisorError> {
        let conn = self.ready_connection(name).await?;
        let call_id = self.next_id();
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments,
        })
        .map_err(|e| SupervisorError::MalformedResponse {
            server: name.to_string(),
            reason: format!("invalid arguments: {}", e),
        })?;

        let frame = conn
            .request(call_id, Method::CallTool, params, tool, self.timeouts.call)
            .await?;
        interpret_call(name, tool, call_id, frame)
    }

    /// 关闭所有连接并清空连接表；可重复调用，进行中的调用以 ProcessExited 结束
    pub async fn cleanup(&self) {
        let mut gates: Vec<(String, Arc<tokio::sync::Mutex<()>>)> = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        gates.sort_by(|a, b| a.0.cmp(&b.0));
        let mut guards = Vec::with_capacity(gates.len());
        for (_, gate) in &gates {
            guards.push(gate.lock().await);
        }

        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.connections.write().await;
            conns.drain().map(|(_, c)| c).collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "shutting down providers");
        let grace = self.timeouts.shutdown_grace;
        futures_util::future::join_all(drained.iter().map(|c| c.shutdown(grace))).await;
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(SupervisorTimeouts::default())
    }
}

/// 解释 call_tool 的响应帧：-32601 为 ToolNotFound；其它错误对象为 is_error 结果；
/// 缺少 content 视为带错误标记的空结果。
fn interpret_call(server: &str, tool: &str, call_id: u64, frame: ResponseFrame) -> Result<ToolCallResponse, SupervisorError> {
    if let Some(err) = frame.error {
        if err.code == TOOL_NOT_FOUND {
            return Err(SupervisorError::ToolNotFound {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }
        return Ok(ToolCallResponse {
            call_id,
            content: Value::String(err.message),
            is_error: true,
        });
    }

    let result = frame.result.unwrap_or(Value::Null);
    let parsed: CallToolResult = serde_json::from_value(result).map_err(|e| SupervisorError::MalformedResponse {
        server: server.to_string(),
        reason: format!("invalid call_tool result: {}", e),
    })?;
    match parsed.content {
        Some(content) => Ok(ToolCallResponse {
            call_id,
            content,
            is_error: parsed.is_error,
        }),
        None => {
            tracing::warn!(server = %server, tool = %tool, call_id, "tool result without content");
            Ok(ToolCallResponse {
                call_id,
                content: Value::Null,
                is_error: true,
            })
        }
    }
}

#[async_trait]
impl ToolProvider for Manager {
    async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, SupervisorError> {
        Manager::list_tools(self, server).await
    }

    async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolCallResponse, SupervisorError> {
        Manager::call_tool(self, server, tool, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> SupervisorTimeouts {
        SupervisorTimeouts {
            startup: Duration::from_millis(300),
            call: Duration::from_millis(300),
            shutdown_grace: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_call_unknown_server_fails_fast() {
        let manager = Manager::new(fast());
        let started = std::time::Instant::now();
        let err = manager.call_tool("nowhere", "echo", json!({})).await.unwrap_err();
        assert_eq!(err, SupervisorError::ServerNotInitialized("nowhere".into()));
        assert!(started.elapsed() < Duration::from_millis(100));

        let err = manager.list_tools("nowhere").await.unwrap_err();
        assert_eq!(err.kind(), "server_not_initialized");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let manager = Manager::new(fast());
        let err = manager
            .initialize("ghost", ServerConfig::new("ghost", "/definitely/not/a/binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessSpawn { ref server, .. } if server == "ghost"));
        assert_eq!(manager.status("ghost").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_timeout_leaves_failed_status() {
        let manager = Manager::new(fast());
        let err = manager
            .initialize("sleepy", ServerConfig::new("sleepy", "sleep").with_args(["5"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "handshake_timeout");
        assert_eq!(manager.status("sleepy").await, Some(ServerStatus::Failed));
        let err = manager.call_tool("sleepy", "echo", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "server_not_initialized");
        manager.cleanup().await;
        assert_eq!(manager.status("sleepy").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_malformed_reply_fails_call_without_waiting() {
        let script = r#"echo '{"event":"ready"}'
while read -r line; do
  id=$(echo "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  printf '{"id":%s,"error":"boom"}\n' "$id"
done"#;
        let manager = Manager::new(SupervisorTimeouts {
            call: Duration::from_secs(5),
            ..fast()
        });
        manager
            .initialize("odd", ServerConfig::new("odd", "sh").with_args(["-c", script]))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = manager.call_tool("odd", "echo", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.status("odd").await, Some(ServerStatus::Ready));
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_twice_is_safe() {
        let manager = Manager::new(fast());
        manager.cleanup().await;
        manager.cleanup().await;
        assert!(ToolProvider::server_names(&manager).await.is_empty());
    }

    #[test]
    fn test_interpret_tool_not_found() {
        let frame = ResponseFrame::err(4, TOOL_NOT_FOUND, "unknown tool");
        let err = interpret_call("manuals", "nope", 4, frame).unwrap_err();
        assert_eq!(
            err,
            SupervisorError::ToolNotFound {
                server: "manuals".into(),
                tool: "nope".into()
            }
        );
    }

    #[test]
    fn test_interpret_provider_error_is_flagged_result() {
        let frame = ResponseFrame::err(5, -1, "db offline");
        let resp = interpret_call("crm", "lookup", 5, frame).unwrap();
        assert!(resp.is_error);
        assert_eq!(resp.text(), "db offline");
    }

    #[test]
    fn test_interpret_missing_content_is_empty_error() {
        let frame = ResponseFrame::ok(6, json!({"isError": false}));
        let resp = interpret_call("crm", "lookup", 6, frame).unwrap();
        assert_eq!(resp.call_id, 6);
        assert!(resp.is_error);
        assert_eq!(resp.text(), "");
    }

    #[test]
    fn test_interpret_non_object_result_is_malformed() {
        let frame = ResponseFrame::ok(7, json!("just text"));
        let err = interpret_call("crm", "lookup", 7, frame).unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }
}
