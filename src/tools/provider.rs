//! 工具能力接口
//!
//! 外部子进程（supervisor::Manager）与进程内注册表（LocalToolProvider）实现同一个 ToolProvider，
//! 启动时按配置选定一个实现并注入图中，调用点不再按环境分支。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::SupervisorError;
use crate::supervisor::{ToolCallResponse, ToolDescriptor};
use crate::tools::ToolRegistry;

/// 工具能力：列出某服务的工具、调用某服务的工具
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// 已知的服务名（排序）
    async fn server_names(&self) -> Vec<String>;

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, SupervisorError>;

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResponse, SupervisorError>;
}

/// 进程内后端：服务名 -> ToolRegistry，调用带超时，失败语义与 Manager 一致
pub struct LocalToolProvider {
    servers: BTreeMap<String, ToolRegistry>,
    next_call_id: AtomicU64,
    call_timeout: Duration,
}

impl LocalToolProvider {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            servers: BTreeMap::new(),
            next_call_id: AtomicU64::new(1),
            call_timeout,
        }
    }

    pub fn with_server(mut self, name: impl Into<String>, registry: ToolRegistry) -> Self {
        self.servers.insert(name.into(), registry);
        self
    }
}

#[async_trait]
impl ToolProvider for LocalToolProvider {
    async fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, SupervisorError> {
        self.servers
            .get(server)
            .map(ToolRegistry::descriptors)
            .ok_or_else(|| SupervisorError::ServerNotInitialized(server.to_string()))
    }

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResponse, SupervisorError> {
        let registry = self
            .servers
            .get(server)
            .ok_or_else(|| SupervisorError::ServerNotInitialized(server.to_string()))?;
        let handler = registry.get(tool).ok_or_else(|| SupervisorError::ToolNotFound {
            server: server.to_string(),
            tool: tool.to_string(),
        })?;
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);

        match timeout(self.call_timeout, handler.execute(arguments)).await {
            Ok(Ok(content)) => Ok(ToolCallResponse {
                call_id,
                content: Value::String(content),
                is_error: false,
            }),
            Ok(Err(message)) => Ok(ToolCallResponse {
                call_id,
                content: Value::String(message),
                is_error: true,
            }),
            Err(_) => Err(SupervisorError::ToolCallTimeout {
                server: server.to_string(),
                tool: tool.to_string(),
                millis: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}
