//! 优雅关闭
//!
//! Ctrl+C / SIGTERM / quit 命令都汇聚到同一个 CancellationToken；ShutdownCoordinator
//! 按注册顺序执行清理任务（停止供应进程等），每个任务单独限时，失败只记日志。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::supervisor::Manager;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 quit 命令
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：第一次触发的原因被记录，之后的触发忽略
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子任务可持有的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                tracing::info!(?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM（unix）处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的任务名
    fn name(&self) -> &'static str;
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时（秒）
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    /// 依次执行清理任务，返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(reason = ?self.manager.reason(), tasks = self.tasks.len(), "running cleanup");
        let mut completed = 0;
        for task in &self.tasks {
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!(task = task.name(), "cleanup done");
                }
                Ok(Err(e)) => tracing::warn!(task = task.name(), error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(task = task.name(), secs = self.timeout.as_secs(), "cleanup timed out"),
            }
        }
        completed
    }
}

/// 停止所有供应进程，在途调用以 ProcessExited 结束
pub struct SupervisorCleanup {
    manager: Arc<Manager>,
}

impl SupervisorCleanup {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SupervisorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.manager.cleanup().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "supervisor"
    }
}

/// 运行 `app` 直到它结束或收到关闭信号，然后执行 `cleanup`
pub async fn run_with_graceful_shutdown<F, C, Fut>(manager: Arc<ShutdownManager>, app: F, cleanup: C)
where
    F: Future<Output = ()>,
    C: FnOnce() -> Fut,
    Fut: Future,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("application finished"),
        _ = manager.wait_for_shutdown() => tracing::info!(reason = ?manager.reason(), "shutting down"),
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Counting {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_stuck_task_does_not_block_others() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new())).with_timeout(1);
        coordinator.register(Stuck);
        coordinator.register(Counting(count.clone()));

        assert_eq!(coordinator.run_cleanup().await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervisor_cleanup_is_repeatable() {
        let manager = Arc::new(Manager::default());
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(SupervisorCleanup::new(manager.clone()));
        coordinator.register(SupervisorCleanup::new(manager));
        assert_eq!(coordinator.run_cleanup().await, 2);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_app() {
        let manager = Arc::new(ShutdownManager::new());
        let cleaned = Arc::new(AtomicUsize::new(0));
        let trigger = manager.clone();
        let c = cleaned.clone();
        run_with_graceful_shutdown(
            manager,
            async move {
                trigger.shutdown(ShutdownReason::FatalError("boom".into()));
                std::future::pending::<()>().await;
            },
            || async move {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }
}
