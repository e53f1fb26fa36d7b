//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat

use std::time::Duration;

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 客户端；未设置 `DEEPSEEK_API_KEY` 时返回 None
///
/// 模型优先取参数，其次 `DEEPSEEK_MODEL` 环境变量，最后 deepseek-chat
pub fn create_deepseek_client(
    model: Option<&str>,
    base_url: Option<&str>,
    request_timeout: Duration,
) -> Option<OpenAiClient> {
    let api_key = std::env::var("DEEPSEEK_API_KEY").ok()?;

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    Some(OpenAiClient::new(
        Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)),
        &model,
        Some(api_key.as_str()),
        request_timeout,
    ))
}
