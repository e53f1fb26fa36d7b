//! 工具执行器
//!
//! 持有注入的 ToolProvider 与工具目录（工具名 -> 服务名，启动时由 list_tools 构建），
//! 每次调用输出结构化审计日志（JSON）。execute_pending 从不失败：错误转为带错误标记的结果。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::core::SupervisorError;
use crate::supervisor::{ToolCallResponse, ToolDescriptor};
use crate::tools::ToolProvider;

/// 工具目录中的一项
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub server: String,
    pub descriptor: ToolDescriptor,
}

/// 一次待执行工具调用的结果（已转为文本）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

pub struct ToolExecutor {
    provider: Arc<dyn ToolProvider>,
    catalog: BTreeMap<String, CatalogEntry>,
}

impl ToolExecutor {
    /// 向每个服务请求 list_tools 构建目录；同名工具以先出现的服务为准，失败的服务跳过
    pub async fn discover(provider: Arc<dyn ToolProvider>) -> Self {
        let mut catalog: BTreeMap<String, CatalogEntry> = BTreeMap::new();
        for server in provider.server_names().await {
            match provider.list_tools(&server).await {
                Ok(tools) => {
                    tracing::info!(server = %server, count = tools.len(), "tools discovered");
                    for descriptor in tools {
                        if let Some(existing) = catalog.get(&descriptor.name) {
                            tracing::warn!(tool = %descriptor.name, kept = %existing.server, ignored = %server, "duplicate tool name");
                            continue;
                        }
                        catalog.insert(
                            descriptor.name.clone(),
                            CatalogEntry {
                                server: server.clone(),
                                descriptor,
                            },
                        );
                    }
                }
                Err(e) => tracing::warn!(server = %server, error = %e, "list_tools failed"),
            }
        }
        Self { provider, catalog }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.catalog.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn server_for(&self, tool: &str) -> Option<&str> {
        self.catalog.get(tool).map(|e| e.server.as_str())
    }

    /// 直接调用（服务名已知），带审计日志；错误原样返回
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallResponse, SupervisorError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = self.provider.call_tool(server, tool, args).await;

        let outcome = match &result {
            Ok(resp) if !resp.is_error => "ok",
            Ok(_) => "tool_error",
            Err(e) => e.kind(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "server": server,
            "tool": tool,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    /// 执行 Agent 请求的调用：服务名缺省时查目录；任何失败都转为 is_error 结果
    pub async fn execute_pending(&self, tool: &str, server: Option<&str>, args: Value) -> ToolOutcome {
        let server = match server.or_else(|| self.server_for(tool)) {
            Some(s) => s.to_string(),
            None => {
                tracing::warn!(tool = %tool, "no provider offers this tool");
                return ToolOutcome {
                    content: format!("Tool not found: {}", tool),
                    is_error: true,
                };
            }
        };
        match self.call(&server, tool, args).await {
            Ok(resp) => ToolOutcome {
                content: resp.text(),
                is_error: resp.is_error,
            },
            Err(e) => ToolOutcome {
                content: e.to_string(),
                is_error: true,
            },
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, LocalToolProvider, ToolRegistry};
    use serde_json::json;
    use std::time::Duration;

    async fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let provider = LocalToolProvider::new(Duration::from_secs(1)).with_server("local", registry);
        ToolExecutor::discover(Arc::new(provider)).await
    }

    #[tokio::test]
    async fn test_discover_builds_catalog() {
        let ex = executor().await;
        assert_eq!(ex.server_for("echo"), Some("local"));
        assert_eq!(ex.descriptors().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_pending_resolves_server() {
        let ex = executor().await;
        let out = ex.execute_pending("echo", None, json!({"text": "oi"})).await;
        assert_eq!(out, ToolOutcome { content: "oi".into(), is_error: false });
    }

    #[tokio::test]
    async fn test_execute_pending_never_fails() {
        let ex = executor().await;
        let out = ex.execute_pending("missing", None, json!({})).await;
        assert!(out.is_error);

        let out = ex.execute_pending("echo", Some("elsewhere"), json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("elsewhere"));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
    }
}
