//! 工具供应进程注册表
//!
//! 启动时由配置 `[[servers]]` 构建，之后只读；名称唯一。

use std::collections::{BTreeMap, HashMap};

use crate::config::ServerEntry;
use crate::core::ConfigError;

/// 单个供应进程的启动规格；进程启动后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl From<&ServerEntry> for ServerConfig {
    fn from(entry: &ServerEntry) -> Self {
        Self {
            name: entry.name.clone(),
            command: entry.command.clone(),
            args: entry.args.clone(),
            env: entry.env.clone(),
        }
    }
}

/// 静态注册表：名称 -> 启动规格（按名称排序，初始化顺序稳定）
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerConfig>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[ServerEntry]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for entry in entries {
            registry.register(ServerConfig::from(entry))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, config: ServerConfig) -> Result<(), ConfigError> {
        if self.servers.contains_key(&config.name) {
            return Err(ConfigError::DuplicateServer(config.name));
        }
        self.servers.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
