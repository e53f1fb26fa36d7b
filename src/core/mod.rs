//! 核心层：错误类型、优雅关闭、工具并发调度

pub mod error;
pub mod shutdown;
pub mod task_scheduler;

pub use error::{ConfigError, SupervisorError};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, SupervisorCleanup,
};
pub use task_scheduler::TaskScheduler;
