//! 轮次状态与合并规则
//!
//! 消息是封闭的标签联合（用户文本 / 助手文本 / 工具调用请求 / 工具结果），
//! 「最后一条消息是否带待执行调用」是结构匹配而非字段探测。
//! 每个字段有固定的 reducer，无论哪个阶段写入都一样：
//! - messages：追加，保持顺序
//! - current_profile：有新值则替换，否则保留
//! - commerce_data：浅合并，新键覆盖同名旧键，其余旧键保留

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Agent 请求执行的一次工具调用；id 为消息级唯一标识，用于结果回配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// 指定服务；缺省时由工具目录解析
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

impl PendingToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            arguments,
            server: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    User {
        text: String,
    },
    Assistant {
        text: String,
        /// LLM 不可用等降级情况下生成的回复
        #[serde(default)]
        degraded: bool,
    },
    ToolCalls {
        calls: Vec<PendingToolCall>,
    },
    ToolResult {
        call_id: String,
        tool: String,
        content: String,
        is_error: bool,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            degraded: false,
        }
    }

    pub fn degraded(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            degraded: true,
        }
    }

    /// 若消息携带待执行的工具调用则返回它们
    pub fn pending_calls(&self) -> Option<&[PendingToolCall]> {
        match self {
            Self::ToolCalls { calls } if !calls.is_empty() => Some(calls),
            _ => None,
        }
    }
}

/// 外部查询状态标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    #[default]
    Ok,
    Error,
}

/// 客户档案（身份解析阶段的结果）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CustomerProfile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub status: LookupStatus,
    /// 供应方返回的其它字段
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CustomerProfile {
    /// 查询失败时的占位档案
    pub fn unavailable() -> Self {
        Self {
            status: LookupStatus::Error,
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == LookupStatus::Error
    }
}

/// 单轮对话状态；每轮独占，不在并发轮次间共享
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TurnState {
    pub messages: Vec<Message>,
    pub current_profile: Option<CustomerProfile>,
    pub commerce_data: Map<String, Value>,
    /// 联系人标识（电话/邮箱），由调用方提供，用于身份解析
    #[serde(default)]
    pub contact: Option<String>,
}

/// 阶段返回的部分更新
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatePatch {
    pub messages: Vec<Message>,
    pub current_profile: Option<CustomerProfile>,
    pub commerce_data: Map<String, Value>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn profile(mut self, profile: CustomerProfile) -> Self {
        self.current_profile = Some(profile);
        self
    }

    pub fn commerce(mut self, key: impl Into<String>, value: Value) -> Self {
        self.commerce_data.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.current_profile.is_none() && self.commerce_data.is_empty()
    }
}

pub fn append_messages(mut existing: Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    existing.extend(incoming);
    existing
}

pub fn replace_if_present<T>(existing: Option<T>, incoming: Option<T>) -> Option<T> {
    incoming.or(existing)
}

pub fn merge_shallow(mut existing: Map<String, Value>, incoming: Map<String, Value>) -> Map<String, Value> {
    for (k, v) in incoming {
        existing.insert(k, v);
    }
    existing
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    /// 按字段规则合并补丁
    pub fn apply(&mut self, patch: StatePatch) {
        self.messages = append_messages(std::mem::take(&mut self.messages), patch.messages);
        self.current_profile = replace_if_present(self.current_profile.take(), patch.current_profile);
        self.commerce_data = merge_shallow(std::mem::take(&mut self.commerce_data), patch.commerce_data);
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 本轮查询：最后一条用户消息
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// 本轮消息：从最后一条用户消息开始
    pub fn current_turn(&self) -> &[Message] {
        let start = self
            .messages
            .iter()
            .rposition(|m| matches!(m, Message::User { .. }))
            .unwrap_or(0);
        &self.messages[start..]
    }

    /// 最后一条用户消息之后的最后一条助手回复
    pub fn last_assistant(&self) -> Option<(&str, bool)> {
        for m in self.messages.iter().rev() {
            match m {
                Message::Assistant { text, degraded } => return Some((text.as_str(), *degraded)),
                Message::User { .. } => return None,
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(tag: &str, n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("{}-{}", tag, i))).collect()
    }

    #[test]
    fn test_messages_append_is_concatenation() {
        for n in 0..5 {
            let batches: Vec<Vec<Message>> = (0..n).map(|i| batch(&i.to_string(), i + 1)).collect();
            let mut state = TurnState::new();
            for b in &batches {
                state.apply(StatePatch::new().messages(b.clone()));
            }
            let expected: Vec<Message> = batches.concat();
            assert_eq!(state.messages, expected);
        }
    }

    #[test]
    fn test_messages_append_associative() {
        let (a, b, c) = (batch("a", 2), batch("b", 1), batch("c", 3));
        let left = append_messages(append_messages(a.clone(), b.clone()), c.clone());
        let right = append_messages(a, append_messages(b, c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_profile_replace_if_present() {
        let mut state = TurnState::new();
        let p = CustomerProfile {
            name: Some("Ana".into()),
            ..CustomerProfile::default()
        };
        state.apply(StatePatch::new().profile(p.clone()));
        state.apply(StatePatch::new());
        assert_eq!(state.current_profile, Some(p));

        state.apply(StatePatch::new().profile(CustomerProfile::unavailable()));
        assert!(state.current_profile.unwrap().is_error());
    }

    #[test]
    fn test_commerce_shallow_merge() {
        let mut state = TurnState::new();
        state.apply(StatePatch::new().commerce("orders", json!([1, 2])).commerce("status", json!("ok")));
        state.apply(StatePatch::new().commerce("status", json!("error")));
        assert_eq!(state.commerce_data["orders"], json!([1, 2]));
        assert_eq!(state.commerce_data["status"], json!("error"));
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let mut state = TurnState::new().with_contact("+55 11 90000-0000");
        state.apply(
            StatePatch::new()
                .message(Message::user("oi"))
                .commerce("cart", json!({"items": 1})),
        );
        let before = state.clone();
        state.apply(StatePatch::new());
        assert_eq!(state, before);
        assert_eq!(merge_shallow(before.commerce_data.clone(), Map::new()), before.commerce_data);
    }

    #[test]
    fn test_pending_calls_structural() {
        assert!(Message::assistant("oi").pending_calls().is_none());
        assert!(Message::ToolCalls { calls: vec![] }.pending_calls().is_none());
        let m = Message::ToolCalls {
            calls: vec![PendingToolCall::new("echo", json!({}))],
        };
        assert_eq!(m.pending_calls().unwrap().len(), 1);
    }

    #[test]
    fn test_message_serialization_tagged() {
        let v = serde_json::to_value(Message::user("oi")).unwrap();
        assert_eq!(v, json!({"kind": "user", "text": "oi"}));
    }

    #[test]
    fn test_last_assistant_scoped_to_turn() {
        let mut state = TurnState::new();
        state.apply(StatePatch::new().message(Message::user("a")).message(Message::assistant("r1")));
        assert_eq!(state.last_assistant(), Some(("r1", false)));
        state.apply(StatePatch::new().message(Message::user("b")));
        assert_eq!(state.last_assistant(), None);
        assert_eq!(state.last_user_text(), Some("b"));
    }
}
