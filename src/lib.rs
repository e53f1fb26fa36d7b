//! Dealer - 工具编排层
//!
//! 模块划分：
//! - **agent**: 启动装配（选择工具后端、初始化供应进程、构建对话图）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭、工具并发调度
//! - **graph**: 工具路由、轮次状态、Agent 推理与对话状态机
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: tracing 订阅器
//! - **supervisor**: 工具供应子进程的启动、握手、调用与关闭
//! - **tools**: Tool trait、注册表、能力接口与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod graph;
pub mod llm;
pub mod observability;
pub mod supervisor;
pub mod tools;
