//! 对话图引擎
//!
//! 状态机：Agent → (Tools → Agent)* → Identity → Commerce → Action。
//! 最后一条消息带待执行调用时进入 Tools，否则线性走完富化阶段。Tools 的访问次数受
//! `max_agent_steps` 限制，用尽后 Agent 不再获得工具。

use std::sync::Arc;

use serde::Serialize;

use crate::config::GraphSection;
use crate::core::TaskScheduler;
use crate::graph::nodes::{self, StageContext};
use crate::graph::planner::Planner;
use crate::graph::router::ToolRouter;
use crate::graph::state::{Message, StatePatch, TurnState};
use crate::tools::ToolExecutor;

/// 图中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Agent,
    Tools,
    Identity,
    Commerce,
    Action,
}

/// 一轮对话的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub state: TurnState,
    /// 按顺序访问过的阶段
    pub trace: Vec<Stage>,
}

pub struct ConversationGraph {
    ctx: StageContext,
    max_agent_steps: usize,
}

impl ConversationGraph {
    pub fn new(
        planner: Planner,
        executor: Arc<ToolExecutor>,
        router: ToolRouter,
        scheduler: TaskScheduler,
        settings: &GraphSection,
    ) -> Self {
        Self {
            ctx: StageContext {
                planner,
                executor,
                router,
                scheduler,
                identity: settings.identity.clone(),
                commerce: settings.commerce.clone(),
            },
            max_agent_steps: settings.max_agent_steps,
        }
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.ctx.executor
    }

    pub fn router(&self) -> &ToolRouter {
        &self.ctx.router
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.ctx.planner.token_usage()
    }

    /// 跑一轮：追加用户消息后从 Agent 开始，直到 Action 产出回复。
    /// `prior` 为上一轮的状态（跨轮记忆由调用方决定是否保留）。
    pub async fn run_turn(&self, query: &str, prior: Option<TurnState>) -> TurnOutcome {
        let mut state = prior.unwrap_or_default();
        state.apply(StatePatch::new().message(Message::user(query)));

        let mut trace = Vec::new();
        let mut tool_rounds = 0usize;
        let mut stage = Stage::Agent;

        loop {
            trace.push(stage);
            tracing::debug!(stage = ?stage, "enter stage");
            stage = match stage {
                Stage::Agent => {
                    let allow_tools = tool_rounds < self.max_agent_steps;
                    let patch = nodes::agent(&self.ctx, &state, allow_tools).await;
                    state.apply(patch);
                    if state.last_message().and_then(Message::pending_calls).is_some() {
                        Stage::Tools
                    } else {
                        Stage::Identity
                    }
                }
                Stage::Tools => {
                    tool_rounds += 1;
                    let patch = nodes::tools(&self.ctx, &state).await;
                    state.apply(patch);
                    Stage::Agent
                }
                Stage::Identity => {
                    let patch = nodes::identity(&self.ctx, &state).await;
                    state.apply(patch);
                    Stage::Commerce
                }
                Stage::Commerce => {
                    let patch = nodes::commerce(&self.ctx, &state).await;
                    state.apply(patch);
                    Stage::Action
                }
                Stage::Action => {
                    let (patch, reply) = nodes::action(&self.ctx, &state);
                    state.apply(patch);
                    tracing::info!(stages = trace.len(), tool_rounds, "turn completed");
                    return TurnOutcome { reply, state, trace };
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, LlmClient, MockLlmClient};
    use crate::tools::{EchoTool, LocalToolProvider, Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 按脚本依次返回输出的 LLM
    struct ScriptedLlm {
        outputs: Mutex<Vec<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(outputs: Vec<Result<&str, &str>>) -> Self {
            Self {
                outputs: Mutex::new(
                    outputs
                        .into_iter()
                        .rev()
                        .map(|o| o.map(String::from).map_err(String::from))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outputs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("done".to_string()))
        }
    }

    struct RealtimeUsersTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for RealtimeUsersTool {
        fn name(&self) -> &str {
            "get_ga4_realtime_users"
        }
        fn description(&self) -> &str {
            "Usuários ativos no site agora"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("42".to_string())
        }
    }

    async fn graph_with(llm: Arc<dyn LlmClient>, tool_calls: Arc<AtomicUsize>, max_agent_steps: usize) -> ConversationGraph {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(RealtimeUsersTool { calls: tool_calls });
        let provider = LocalToolProvider::new(Duration::from_secs(1)).with_server("analytics", registry);
        let executor = ToolExecutor::discover(Arc::new(provider)).await;
        let settings = GraphSection {
            max_agent_steps,
            ..GraphSection::default()
        };
        ConversationGraph::new(
            Planner::new(llm, "Assistente da concessionária"),
            Arc::new(executor),
            ToolRouter::new(),
            TaskScheduler::unbounded(),
            &settings,
        )
    }

    #[tokio::test]
    async fn test_single_tool_call_visits_tools_once() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(r#"{"tool": "get_ga4_realtime_users", "args": {}}"#),
            Ok("Há 42 usuários no site agora."),
        ]));
        let tool_calls = Arc::new(AtomicUsize::new(0));
        let graph = graph_with(llm.clone(), tool_calls.clone(), 6).await;

        let outcome = graph.run_turn("Quantos usuários estão no site agora?", None).await;

        assert_eq!(
            outcome.trace,
            vec![Stage::Agent, Stage::Tools, Stage::Agent, Stage::Identity, Stage::Commerce, Stage::Action]
        );
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);

        let results: Vec<&Message> = outcome
            .state
            .messages
            .iter()
            .filter(|m| matches!(m, Message::ToolResult { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        let call_id = match &outcome.state.messages[1] {
            Message::ToolCalls { calls } => calls[0].id.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(results[0], Message::ToolResult { call_id: id, content, is_error: false, .. } if *id == call_id && content == "42"));
        assert_eq!(outcome.reply, "Há 42 usuários no site agora.");
    }

    #[tokio::test]
    async fn test_total_external_failure_still_replies() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err("connection refused")]));
        let graph = graph_with(llm, Arc::new(AtomicUsize::new(0)), 6).await;
        let prior = TurnState::new().with_contact("ana@example.com");

        let outcome = graph.run_turn("Qual o preço da PCX?", Some(prior)).await;

        assert_eq!(
            outcome.trace,
            vec![Stage::Agent, Stage::Identity, Stage::Commerce, Stage::Action]
        );
        assert!(!outcome.reply.is_empty());
        assert!(outcome.reply.contains("Aviso"));
        assert!(outcome.state.current_profile.as_ref().unwrap().is_error());
        assert!(matches!(outcome.state.messages.last(), Some(Message::Assistant { .. })));
    }

    #[tokio::test]
    async fn test_failing_tool_becomes_error_result() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(r#"{"tool": "search_catalog", "args": {"query": "PCX"}}"#),
            Ok("Não encontrei o preço."),
        ]));
        let graph = graph_with(llm, Arc::new(AtomicUsize::new(0)), 6).await;
        let outcome = graph.run_turn("preço da PCX", None).await;

        assert!(outcome.state.messages.iter().any(|m| matches!(m, Message::ToolResult { is_error: true, .. })));
        assert!(outcome.reply.starts_with("Não encontrei o preço."));
        assert!(outcome.reply.contains("Aviso"));
    }

    #[tokio::test]
    async fn test_step_limit_bounds_tool_rounds() {
        let looping = r#"{"tool": "echo", "args": {"text": "again"}}"#;
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(looping); 10]));
        let graph = graph_with(llm, Arc::new(AtomicUsize::new(0)), 2).await;
        let outcome = graph.run_turn("repete", None).await;

        let tools_visits = outcome.trace.iter().filter(|s| **s == Stage::Tools).count();
        assert_eq!(tools_visits, 2);
        assert_eq!(outcome.trace.last(), Some(&Stage::Action));
        assert!(outcome.reply.contains("limite"));
    }

    #[tokio::test]
    async fn test_mock_llm_end_to_end() {
        let tool_calls = Arc::new(AtomicUsize::new(0));
        let graph = graph_with(Arc::new(MockLlmClient::new()), tool_calls.clone(), 6).await;

        let outcome = graph.run_turn("Quantos usuários no site agora?", None).await;
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
        assert!(outcome.reply.contains("42"));

        // 携带上一轮状态继续对话
        let next = graph.run_turn("Olá, tudo bem?", Some(outcome.state)).await;
        assert_eq!(next.trace, vec![Stage::Agent, Stage::Identity, Stage::Commerce, Stage::Action]);
        assert_eq!(next.state.last_user_text(), Some("Olá, tudo bem?"));
    }
}
