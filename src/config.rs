//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DEALER__*` 覆盖（双下划线表示嵌套，如 `DEALER__TOOLS__BACKEND=local`）。
//! 工具供应进程注册表（`[[servers]]`）在启动时固定，修改后需重启监管器。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::ConfigError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub supervisor: SupervisorSection,
    pub tools: ToolsSection,
    pub graph: GraphSection,
    /// 工具供应进程的启动规格
    pub servers: Vec<ServerEntry>,
}

/// [app] 段：应用名与联系人标识（身份查询用）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 默认联系人（电话/邮箱），命令行前端未指定时使用
    pub default_contact: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// [supervisor] 段：握手、调用、关闭的超时（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_startup_timeout() -> u64 {
    15
}

fn default_call_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    3
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            call_timeout_secs: default_call_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorSection {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// 工具后端：外部子进程或进程内注册表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolBackend {
    Process,
    Local,
}

/// [tools] 段：后端选择与并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// "process"（默认）或 "local"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Tools 阶段同时执行的工具调用上限，0 表示不限
    #[serde(default)]
    pub max_concurrent_calls: usize,
}

fn default_backend() -> String {
    "process".to_string()
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_concurrent_calls: 0,
        }
    }
}

impl ToolsSection {
    pub fn backend(&self) -> Result<ToolBackend, ConfigError> {
        match self.backend.to_lowercase().as_str() {
            "process" => Ok(ToolBackend::Process),
            "local" => Ok(ToolBackend::Local),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// 图阶段访问的外部工具（服务名 + 工具名）
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ToolTarget {
    pub server: String,
    pub tool: String,
}

/// [graph] 段：Agent 循环上限与富化阶段使用的外部工具
#[derive(Debug, Clone, Deserialize)]
pub struct GraphSection {
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: usize,
    #[serde(default = "default_identity_target")]
    pub identity: ToolTarget,
    #[serde(default = "default_commerce_target")]
    pub commerce: ToolTarget,
}

fn default_max_agent_steps() -> usize {
    6
}

fn default_identity_target() -> ToolTarget {
    ToolTarget {
        server: "crm".to_string(),
        tool: "get_customer_profile".to_string(),
    }
}

fn default_commerce_target() -> ToolTarget {
    ToolTarget {
        server: "commerce".to_string(),
        tool: "get_customer_orders".to_string(),
    }
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            max_agent_steps: default_max_agent_steps(),
            identity: default_identity_target(),
            commerce: default_commerce_target(),
        }
    }
}

/// [[servers]] 条目：命令、参数、环境变量
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AppConfig {
    /// 服务名唯一、命令非空
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.servers {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::InvalidServer {
                    name: entry.name.clone(),
                    reason: "empty name".to_string(),
                });
            }
            if entry.command.trim().is_empty() {
                return Err(ConfigError::InvalidServer {
                    name: entry.name.clone(),
                    reason: "empty command".to_string(),
                });
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateServer(entry.name.clone()));
            }
        }
        self.tools.backend()?;
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 DEALER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DEALER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DEALER")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(name: &str) -> ServerEntry {
        ServerEntry {
            name: name.to_string(),
            command: "dealer-provider".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.supervisor.call_timeout_secs, 10);
        assert_eq!(cfg.supervisor.startup_timeout_secs, 15);
        assert_eq!(cfg.graph.max_agent_steps, 6);
        assert_eq!(cfg.tools.backend().unwrap(), ToolBackend::Process);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let cfg = AppConfig {
            servers: vec![entry("manuals"), entry("manuals")],
            ..AppConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateServer(name)) if name == "manuals"
        ));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut cfg = AppConfig::default();
        cfg.tools.backend = "remote".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownBackend(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[supervisor]
call_timeout_secs = 4

[tools]
backend = "local"

[[servers]]
name = "manuals"
command = "dealer-provider"
args = ["--quiet"]
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.supervisor.call_timeout_secs, 4);
        assert_eq!(cfg.tools.backend().unwrap(), ToolBackend::Local);
        let manuals = cfg.servers.iter().find(|s| s.name == "manuals").unwrap();
        assert_eq!(manuals.args, vec!["--quiet".to_string()]);
    }
}
