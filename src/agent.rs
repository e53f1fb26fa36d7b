//! Headless Agent 运行时
//!
//! create_agent_components 按配置选定工具后端（子进程 Manager 或进程内注册表）、
//! 初始化所有供应进程、发现工具、选择 LLM 并构建对话图；process_message 跑一轮对话。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, ToolBackend};
use crate::core::TaskScheduler;
use crate::graph::{ConversationGraph, Planner, ToolRouter, TurnOutcome, TurnState};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::supervisor::{Manager, ServerRegistry, SupervisorTimeouts};
use crate::tools::{DelayTool, EchoTool, LocalToolProvider, ToolExecutor, ToolProvider, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "Você é o assistente virtual de uma concessionária de motos. \
Responda em português, de forma curta e objetiva. Use as ferramentas quando a pergunta exigir \
dados do manual, do catálogo ou de acesso ao site; não invente valores.";

/// 预构建的 Agent 组件，可被多轮对话共享
pub struct AgentComponents {
    pub graph: ConversationGraph,
    /// 子进程后端时的监管器，退出前需要 cleanup
    pub supervisor: Option<Arc<Manager>>,
    pub config: AppConfig,
}

/// 按 API Key 与 [llm].provider 选择 LLM；都没有时用离线 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.request_timeout_secs);
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::new());
    }

    if provider == "deepseek" {
        if let Some(client) =
            create_deepseek_client(Some(&cfg.llm.model), cfg.llm.base_url.as_deref(), timeout)
        {
            tracing::info!("Using DeepSeek LLM ({})", client.model());
            return Arc::new(client);
        }
    }

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        return Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            Some(key.as_str()),
            timeout,
        ));
    }

    tracing::warn!("No API key set, using Mock LLM");
    Arc::new(MockLlmClient::new())
}

/// 进程内后端的默认工具
pub fn default_local_registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(DelayTool);
    tools
}

/// 构建工具后端；子进程后端会先初始化所有已注册的服务（单个失败只记日志）
pub async fn build_provider(
    cfg: &AppConfig,
) -> anyhow::Result<(Arc<dyn ToolProvider>, Option<Arc<Manager>>)> {
    let timeouts = SupervisorTimeouts::from(&cfg.supervisor);
    match cfg.tools.backend()? {
        ToolBackend::Local => {
            tracing::info!("Using in-process tool backend");
            let provider =
                LocalToolProvider::new(timeouts.call).with_server("local", default_local_registry());
            Ok((Arc::new(provider), None))
        }
        ToolBackend::Process => {
            let registry = ServerRegistry::from_entries(&cfg.servers)
                .context("Invalid [[servers]] configuration")?;
            let manager = Arc::new(Manager::new(timeouts));
            for (name, result) in manager.initialize_all(&registry).await {
                match result {
                    Ok(()) => tracing::info!(server = %name, "provider ready"),
                    Err(e) => tracing::error!(server = %name, error = %e, "provider failed to start"),
                }
            }
            Ok((manager.clone() as Arc<dyn ToolProvider>, Some(manager)))
        }
    }
}

fn load_system_prompt() -> String {
    ["config/prompts/system.txt", "../config/prompts/system.txt"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

/// 创建 Agent 组件
pub async fn create_agent_components(cfg: AppConfig) -> anyhow::Result<AgentComponents> {
    let (provider, supervisor) = build_provider(&cfg).await?;
    let executor = ToolExecutor::discover(provider).await;
    tracing::info!(tools = executor.descriptors().len(), "tool catalog ready");

    let llm = create_llm_from_config(&cfg);
    let graph = ConversationGraph::new(
        Planner::new(llm, load_system_prompt()),
        Arc::new(executor),
        ToolRouter::new(),
        TaskScheduler::new(cfg.tools.max_concurrent_calls),
        &cfg.graph,
    );

    Ok(AgentComponents {
        graph,
        supervisor,
        config: cfg,
    })
}

/// 处理单条用户消息；`state` 为上一轮状态，首次对话时带上默认联系人
pub async fn process_message(
    components: &AgentComponents,
    state: Option<TurnState>,
    user_input: &str,
) -> TurnOutcome {
    let state = state.or_else(|| {
        components
            .config
            .app
            .default_contact
            .as_ref()
            .map(|c| TurnState::new().with_contact(c.clone()))
    });
    components.graph.run_turn(user_input, state).await
}
