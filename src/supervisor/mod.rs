//! 工具供应进程监管：注册表、协议帧、单进程连接与 Manager

pub mod child;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod registry;

pub use connection::{Connection, ServerStatus};
pub use manager::{Manager, SupervisorTimeouts};
pub use protocol::{ToolCallResponse, ToolDescriptor};
pub use registry::{ServerConfig, ServerRegistry};
