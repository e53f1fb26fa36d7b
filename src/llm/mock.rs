//! Mock LLM 客户端（离线，无需 API）
//!
//! 按 ToolRouter 的类别选择工具（仅当 system prompt 列出了该工具），
//! 已有工具结果时把结果汇总为最终回复，便于本地跑通整张图。

use async_trait::async_trait;

use crate::graph::planner::{OBSERVATION_PREFIX, TOOLS_HEADER};
use crate::graph::router::{ToolCategory, ToolRouter};
use crate::llm::{ChatMessage, LlmClient, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    router: ToolRouter,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn tool_for(category: ToolCategory) -> Option<&'static str> {
        match category {
            ToolCategory::ManualSearch => Some("search_manual"),
            ToolCategory::CatalogSearch => Some("search_catalog"),
            ToolCategory::Analytics => Some("get_ga4_realtime_users"),
            ToolCategory::None => None,
        }
    }
}

fn is_observation(m: &ChatMessage) -> bool {
    m.role == Role::User && m.content.starts_with(OBSERVATION_PREFIX)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, String> {
        let query_idx = messages
            .iter()
            .rposition(|m| m.role == Role::User && !is_observation(m));
        let Some(query_idx) = query_idx else {
            return Ok("(no input)".to_string());
        };
        let query = messages[query_idx].content.as_str();

        let observations: Vec<&str> = messages[query_idx + 1..]
            .iter()
            .filter(|m| is_observation(m))
            .map(|m| &m.content[OBSERVATION_PREFIX.len()..])
            .collect();
        if !observations.is_empty() {
            return Ok(format!("Aqui está o que encontrei:\n{}", observations.join("\n")));
        }

        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let listed = |tool: &str| {
            system.contains(TOOLS_HEADER) && system.contains(&format!("- {}:", tool))
        };

        match Self::tool_for(self.router.route(query)) {
            Some(tool) if listed(tool) => Ok(serde_json::json!({
                "tool": tool,
                "args": { "query": query }
            })
            .to_string()),
            _ => Ok(format!("Echo from Mock: {}", query)),
        }
    }
}
