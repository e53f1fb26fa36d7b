//! 任务调度：Tools 阶段的并发上限
//!
//! 同一批工具调用默认全部并发；配置 `tools.max_concurrent_calls > 0` 时用 Semaphore 限制同时在途的调用数。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 任务调度器；上限为 0 表示不限制
#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    tool_semaphore: Option<Arc<Semaphore>>,
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: (max_concurrent_tools > 0)
                .then(|| Arc::new(Semaphore::new(max_concurrent_tools))),
            max_concurrent_tools,
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// 获取工具执行许可；不限制时立即返回 None
    pub async fn acquire_tool(&self) -> Option<OwnedSemaphorePermit> {
        let sem = self.tool_semaphore.as_ref()?;
        // 信号量从不 close，acquire 只会成功
        sem.clone().acquire_owned().await.ok()
    }

    pub fn limit(&self) -> Option<usize> {
        self.tool_semaphore.as_ref().map(|_| self.max_concurrent_tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_never_blocks() {
        let s = TaskScheduler::unbounded();
        assert!(s.acquire_tool().await.is_none());
        assert_eq!(s.limit(), None);
    }

    #[tokio::test]
    async fn test_bounded_limits_permits() {
        let s = TaskScheduler::new(1);
        let p = s.acquire_tool().await;
        assert!(p.is_some());
        assert_eq!(s.limit(), Some(1));
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), s.acquire_tool()).await;
        assert!(blocked.is_err());
        drop(p);
        assert!(s.acquire_tool().await.is_some());
    }
}
