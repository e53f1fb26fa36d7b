//! 错误类型：工具供应进程监管错误与配置错误
//!
//! Manager 把所有外部失败作为 SupervisorError 返回给直接调用方（图中的某个阶段）；
//! 阶段负责把它们转换成状态补丁，绝不让外部失败中断一轮对话。

use thiserror::Error;

/// 监管器（Manager / LocalToolProvider）可能返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Failed to spawn provider '{server}': {reason}")]
    ProcessSpawn { server: String, reason: String },

    #[error("Provider '{server}' did not signal readiness within {millis}ms")]
    HandshakeTimeout { server: String, millis: u64 },

    #[error("Server not initialized: {0}")]
    ServerNotInitialized(String),

    #[error("Tool not found: {server}/{tool}")]
    ToolNotFound { server: String, tool: String },

    #[error("Tool call timeout: {server}/{tool} after {millis}ms")]
    ToolCallTimeout {
        server: String,
        tool: String,
        millis: u64,
    },

    #[error("Provider process '{0}' exited")]
    ProcessExited(String),

    #[error("Malformed response from '{server}': {reason}")]
    MalformedResponse { server: String, reason: String },

    /// 同名服务已以不同配置运行（调用方编程错误）
    #[error("Server '{0}' is already running with a different config")]
    ConfigConflict(String),
}

impl SupervisorError {
    /// 稳定的错误类别名，用于审计日志与状态补丁
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessSpawn { .. } => "process_spawn",
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::ServerNotInitialized(_) => "server_not_initialized",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::ToolCallTimeout { .. } => "tool_call_timeout",
            Self::ProcessExited(_) => "process_exited",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::ConfigConflict(_) => "config_conflict",
        }
    }
}

/// 配置校验错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Duplicate server name: {0}")]
    DuplicateServer(String),

    #[error("Invalid server entry '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("Unknown tools backend: {0} (expected \"process\" or \"local\")")]
    UnknownBackend(String),
}
