//! Planner：Agent 阶段的推理
//!
//! 拼 system prompt（可用工具、路由提示、调用格式 Schema），把轮次消息转为 LLM 消息后调用 LLM；
//! parse_llm_output 从文本中提取 JSON 并解析为工具调用或直接回复。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::graph::router::ToolCategory;
use crate::graph::state::{Message, PendingToolCall};
use crate::llm::{ChatMessage, LlmClient};
use crate::supervisor::ToolDescriptor;
use crate::tools::{tool_call_batch_schema_json, tool_call_schema_json};

/// 工具结果回写给 LLM 时的前缀
pub const OBSERVATION_PREFIX: &str = "Observation from ";

/// system prompt 中工具列表的标题行
pub const TOOLS_HEADER: &str = "Available tools:";

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复用户
    Response(String),
    /// 需要执行工具（至少一个）
    ToolCalls(Vec<PendingToolCall>),
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToolCallBatch {
    tool_calls: Vec<RawToolCall>,
}

impl RawToolCall {
    fn into_pending(self) -> Option<PendingToolCall> {
        if self.tool.trim().is_empty() {
            return None;
        }
        let mut call = PendingToolCall::new(self.tool, self.args);
        call.server = self.server;
        Some(call)
    }
}

/// 提取 JSON 块（```json ... ``` 或首个 '{' 到最后一个 '}'）
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析 LLM 输出：单个或批量工具调用，否则（含 JSON 解析失败）为直接回复
pub fn parse_llm_output(output: &str) -> PlannerOutput {
    let trimmed = output.trim();
    let Some(json_str) = extract_json(trimmed) else {
        return PlannerOutput::Response(trimmed.to_string());
    };

    let calls: Vec<PendingToolCall> = if let Ok(batch) = serde_json::from_str::<RawToolCallBatch>(json_str) {
        batch.tool_calls.into_iter().filter_map(RawToolCall::into_pending).collect()
    } else if let Ok(single) = serde_json::from_str::<RawToolCall>(json_str) {
        single.into_pending().into_iter().collect()
    } else {
        tracing::debug!(output = %trimmed, "LLM output is not a tool call, treating as text");
        Vec::new()
    };

    if calls.is_empty() {
        PlannerOutput::Response(trimmed.to_string())
    } else {
        PlannerOutput::ToolCalls(calls)
    }
}

/// 轮次消息 -> LLM 消息：工具调用以 JSON 形式作为 assistant 消息，工具结果作为 Observation
pub fn to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| match m {
            Message::User { text } => ChatMessage::user(text.clone()),
            Message::Assistant { text, .. } => ChatMessage::assistant(text.clone()),
            Message::ToolCalls { calls } => {
                let calls: Vec<Value> = calls
                    .iter()
                    .map(|c| serde_json::json!({ "tool": c.name, "args": c.arguments }))
                    .collect();
                ChatMessage::assistant(serde_json::json!({ "tool_calls": calls }).to_string())
            }
            Message::ToolResult {
                tool,
                content,
                is_error,
                ..
            } => {
                let marker = if *is_error { " (error)" } else { "" };
                ChatMessage::user(format!("{}{}{}: {}", OBSERVATION_PREFIX, tool, marker, content))
            }
        })
        .collect()
}

/// 组装 system prompt；`tools` 为空表示本步不允许调用工具
pub fn build_system_prompt(base: &str, tools: &[ToolDescriptor], category: ToolCategory) -> String {
    let mut prompt = String::from(base.trim());
    prompt.push_str("\n\n");

    if tools.is_empty() {
        prompt.push_str("No tools are available for this step. Answer the user directly in plain text.\n");
        return prompt;
    }

    prompt.push_str(TOOLS_HEADER);
    prompt.push('\n');
    for t in tools {
        prompt.push_str(&format!("- {}: {} | input: {}\n", t.name, t.description, t.input_schema));
    }

    prompt.push_str(&format!("\nRouting hint for this query: {}\n", category.as_str()));
    prompt.push_str(
        "\nTo call one tool reply with ONLY a JSON object matching this schema:\n",
    );
    prompt.push_str(&tool_call_schema_json());
    prompt.push_str("\nTo call several independent tools at once use:\n");
    prompt.push_str(&tool_call_batch_schema_json());
    prompt.push_str("\nOtherwise answer the user directly in plain text.\n");
    prompt
}

/// Planner：持有 LLM 与基础 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 一步推理；Err 为 LLM 调用失败
    pub async fn plan(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        category: ToolCategory,
    ) -> Result<PlannerOutput, String> {
        let system = build_system_prompt(&self.system_prompt, tools, category);
        let mut full_messages = vec![ChatMessage::system(system)];
        full_messages.extend(to_chat_messages(messages));
        let output = self.llm.complete(&full_messages).await?;
        Ok(parse_llm_output(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_call() {
        match parse_llm_output(r#"{"tool": "search_manual", "args": {"query": "pneu"}}"#) {
            PlannerOutput::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "search_manual");
                assert_eq!(calls[0].arguments, json!({"query": "pneu"}));
                assert!(calls[0].server.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_batch() {
        let out = "Vou consultar:\n```json\n{\"tool_calls\": [{\"tool\": \"a\", \"args\": {}}, {\"tool\": \"b\", \"args\": {}, \"server\": \"crm\"}]}\n```";
        match parse_llm_output(out) {
            PlannerOutput::ToolCalls(calls) => {
                assert_eq!(calls.len(), 2);
                assert_ne!(calls[0].id, calls[1].id);
                assert_eq!(calls[1].server.as_deref(), Some("crm"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_plain_and_broken() {
        assert_eq!(
            parse_llm_output("  Olá! Tudo bem.  "),
            PlannerOutput::Response("Olá! Tudo bem.".into())
        );
        assert!(matches!(
            parse_llm_output(r#"{"tool": "x", "args": "#),
            PlannerOutput::Response(_)
        ));
        assert!(matches!(
            parse_llm_output(r#"{"tool": "", "args": {}}"#),
            PlannerOutput::Response(_)
        ));
        assert!(matches!(
            parse_llm_output(r#"{"answer": 42}"#),
            PlannerOutput::Response(_)
        ));
    }

    #[test]
    fn test_chat_messages_render_observations() {
        let msgs = vec![
            Message::user("q"),
            Message::ToolCalls {
                calls: vec![PendingToolCall::new("echo", json!({"text": "x"}))],
            },
            Message::ToolResult {
                call_id: "1".into(),
                tool: "echo".into(),
                content: "x".into(),
                is_error: false,
            },
        ];
        let chat = to_chat_messages(&msgs);
        assert_eq!(chat.len(), 3);
        assert!(chat[1].content.contains("tool_calls"));
        assert_eq!(chat[2].content, "Observation from echo: x");
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let tools = vec![ToolDescriptor {
            name: "search_catalog".into(),
            description: "Busca no catálogo".into(),
            input_schema: json!({"type": "object"}),
        }];
        let prompt = build_system_prompt("Base", &tools, ToolCategory::CatalogSearch);
        assert!(prompt.contains(TOOLS_HEADER));
        assert!(prompt.contains("- search_catalog:"));
        assert!(prompt.contains("catalogSearch"));

        let no_tools = build_system_prompt("Base", &[], ToolCategory::CatalogSearch);
        assert!(!no_tools.contains(TOOLS_HEADER));
    }
}
