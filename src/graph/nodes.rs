//! 图的五个阶段
//!
//! 每个阶段读取 TurnState 的一部分并返回 StatePatch。外部调用（LLM、工具、CRM、电商）的
//! 失败都在阶段内部转换为带错误标记的补丁，一轮对话总能走到 Action 并产出回复。

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::ToolTarget;
use crate::core::{SupervisorError, TaskScheduler};
use crate::graph::planner::{Planner, PlannerOutput};
use crate::graph::router::{ToolCategory, ToolRouter};
use crate::graph::state::{CustomerProfile, LookupStatus, Message, StatePatch, TurnState};
use crate::supervisor::ToolCallResponse;
use crate::tools::ToolExecutor;

const LLM_UNAVAILABLE_REPLY: &str =
    "Desculpe, não consegui processar sua pergunta agora. Tente novamente em instantes.";
const STEP_LIMIT_REPLY: &str =
    "Não consegui concluir a consulta dentro do limite de etapas. Pode reformular a pergunta?";
const CLARIFY_REPLY: &str =
    "Não entendi bem o que você precisa. Pode dar mais detalhes? Posso ajudar com o manual da moto, preços do catálogo ou dados de acesso do site.";
const NO_ANSWER_REPLY: &str = "Não consegui obter uma resposta para sua pergunta agora.";
const DEGRADED_NOTICE: &str =
    "(Aviso: alguns serviços externos não responderam; estas informações podem estar incompletas.)";

/// 阶段共享的协作者
pub struct StageContext {
    pub planner: Planner,
    pub executor: Arc<ToolExecutor>,
    pub router: ToolRouter,
    pub scheduler: TaskScheduler,
    pub identity: ToolTarget,
    pub commerce: ToolTarget,
}

/// Agent：询问 LLM 下一步；`allow_tools = false` 时不提供工具，仍请求工具则以降级回复收尾
pub async fn agent(ctx: &StageContext, state: &TurnState, allow_tools: bool) -> StatePatch {
    let query = state.last_user_text().unwrap_or_default();
    let category = ctx.router.route(query);
    let tools = if allow_tools {
        ctx.executor.descriptors()
    } else {
        Vec::new()
    };

    match ctx.planner.plan(&state.messages, &tools, category).await {
        Ok(PlannerOutput::ToolCalls(calls)) if allow_tools => {
            tracing::info!(
                count = calls.len(),
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "agent requested tools"
            );
            StatePatch::new().message(Message::ToolCalls { calls })
        }
        Ok(PlannerOutput::ToolCalls(calls)) => {
            tracing::warn!(count = calls.len(), "tool calls requested after step limit, ignored");
            StatePatch::new().message(Message::degraded(STEP_LIMIT_REPLY))
        }
        Ok(PlannerOutput::Response(text)) => StatePatch::new().message(Message::assistant(text)),
        Err(e) => {
            tracing::warn!(error = %e, "LLM call failed, replying in degraded mode");
            StatePatch::new().message(Message::degraded(LLM_UNAVAILABLE_REPLY))
        }
    }
}

/// Tools：并发执行最后一条消息中的全部待执行调用，结果按请求顺序追加
pub async fn tools(ctx: &StageContext, state: &TurnState) -> StatePatch {
    let Some(calls) = state.last_message().and_then(Message::pending_calls) else {
        return StatePatch::new();
    };

    let results = futures_util::future::join_all(calls.iter().map(|call| async move {
        let _permit = ctx.scheduler.acquire_tool().await;
        let outcome = ctx
            .executor
            .execute_pending(&call.name, call.server.as_deref(), call.arguments.clone())
            .await;
        (call.id.as_str(), outcome)
    }))
    .await;

    // join_all 按输入顺序返回；再按 id 回配，保证结果与请求一一对应
    let mut by_id: std::collections::HashMap<&str, _> = results.into_iter().collect();
    let messages = calls
        .iter()
        .filter_map(|call| {
            by_id.remove(call.id.as_str()).map(|outcome| Message::ToolResult {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                content: outcome.content,
                is_error: outcome.is_error,
            })
        })
        .collect();
    StatePatch::new().messages(messages)
}

/// 工具返回内容转为 JSON：字符串内容尝试再解析一次
fn response_json(resp: &ToolCallResponse) -> Value {
    match &resp.content {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        other => other.clone(),
    }
}

fn failure_message(result: &Result<ToolCallResponse, SupervisorError>) -> Option<String> {
    match result {
        Ok(resp) if resp.is_error => Some(resp.text()),
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    }
}

/// Identity：已有有效档案或不知道联系人时跳过；否则按联系人查询客户档案
pub async fn identity(ctx: &StageContext, state: &TurnState) -> StatePatch {
    if state.current_profile.as_ref().is_some_and(|p| !p.is_error()) {
        return StatePatch::new();
    }
    let Some(contact) = state.contact.as_deref() else {
        return StatePatch::new();
    };

    let target = &ctx.identity;
    let result = ctx
        .executor
        .call(&target.server, &target.tool, json!({ "contact": contact }))
        .await;

    if let Some(message) = failure_message(&result) {
        tracing::warn!(server = %target.server, error = %message, "identity lookup failed");
        let mut profile = CustomerProfile::unavailable();
        profile.extra.insert("error".to_string(), Value::String(message));
        return StatePatch::new().profile(profile);
    }

    let value = result.as_ref().map(response_json).unwrap_or(Value::Null);
    match serde_json::from_value::<CustomerProfile>(value) {
        Ok(mut profile) => {
            profile.status = LookupStatus::Ok;
            tracing::info!(customer_id = ?profile.id, "customer identified");
            StatePatch::new().profile(profile)
        }
        Err(e) => {
            tracing::warn!(error = %e, "identity result is not a profile");
            let mut profile = CustomerProfile::unavailable();
            profile
                .extra
                .insert("error".to_string(), Value::String(format!("invalid profile: {}", e)));
            StatePatch::new().profile(profile)
        }
    }
}

/// Commerce：有客户 id 时查询电商数据，对象结果浅合并进 commerce_data
pub async fn commerce(ctx: &StageContext, state: &TurnState) -> StatePatch {
    let Some(customer_id) = state
        .current_profile
        .as_ref()
        .filter(|p| !p.is_error())
        .and_then(|p| p.id.clone())
    else {
        return StatePatch::new();
    };

    let target = &ctx.commerce;
    let result = ctx
        .executor
        .call(&target.server, &target.tool, json!({ "customer_id": customer_id }))
        .await;

    if let Some(message) = failure_message(&result) {
        tracing::warn!(server = %target.server, error = %message, "commerce lookup failed");
        return StatePatch::new()
            .commerce("status", json!("error"))
            .commerce("error", Value::String(message));
    }

    let mut data = match result.as_ref().map(response_json) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) | Err(_) => Map::new(),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    data.insert("status".to_string(), json!("ok"));
    StatePatch {
        commerce_data: data,
        ..StatePatch::new()
    }
}

/// 本轮是否有任何降级：LLM 降级回复、工具错误、档案或电商查询失败
fn turn_degraded(state: &TurnState) -> bool {
    let in_turn = state.current_turn().iter().any(|m| match m {
        Message::Assistant { degraded, .. } => *degraded,
        Message::ToolResult { is_error, .. } => *is_error,
        _ => false,
    });
    let profile_failed = state.current_profile.as_ref().is_some_and(CustomerProfile::is_error);
    let commerce_failed = state.commerce_data.get("status") == Some(&json!("error"));
    in_turn || profile_failed || commerce_failed
}

/// Action：组装最终回复并写入消息列表
pub fn action(ctx: &StageContext, state: &TurnState) -> (StatePatch, String) {
    let query = state.last_user_text().unwrap_or_default();
    let answer = state
        .last_assistant()
        .map(|(text, _)| text.trim())
        .filter(|text| !text.is_empty());

    let mut reply = match answer {
        Some(text) => text.to_string(),
        None if ctx.router.route(query) == ToolCategory::None => CLARIFY_REPLY.to_string(),
        None => NO_ANSWER_REPLY.to_string(),
    };

    if let Some(name) = state
        .current_profile
        .as_ref()
        .filter(|p| !p.is_error())
        .and_then(|p| p.name.as_deref())
        .and_then(|n| n.split_whitespace().next())
    {
        reply = format!("{}, {}", name, reply);
    }

    if turn_degraded(state) {
        reply.push_str("\n\n");
        reply.push_str(DEGRADED_NOTICE);
    }

    (StatePatch::new().message(Message::assistant(reply.clone())), reply)
}
