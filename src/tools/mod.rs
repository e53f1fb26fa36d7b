//! 工具层：Tool trait 与注册表、能力接口（本地 / 子进程）、执行器、内置诊断工具

pub mod diagnostics;
pub mod echo;
pub mod executor;
pub mod provider;
pub mod registry;
pub mod schema;

pub use diagnostics::{CrashTool, DelayTool};
pub use echo::EchoTool;
pub use executor::{CatalogEntry, ToolExecutor, ToolOutcome};
pub use provider::{LocalToolProvider, ToolProvider};
pub use registry::{Tool, ToolRegistry};
pub use schema::{tool_call_batch_schema_json, tool_call_schema_json};
