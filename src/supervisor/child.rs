//! 子进程优雅关闭：SIGTERM → 等待 → SIGKILL → 回收

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
#[cfg(unix)]
use tokio::time::timeout;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// 关闭子进程：unix 先发 SIGTERM 并等待 `grace`，仍存活则 SIGKILL；其它平台直接 kill
pub async fn shutdown_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    // 已退出的进程直接回收
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                if e == nix::errno::Errno::ESRCH {
                    return child.wait().await;
                }
                return Err(io::Error::other(e));
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        child.kill().await?;
        return child.wait().await;
    }

    #[cfg(unix)]
    {
        if let Ok(result) = timeout(grace, child.wait()).await {
            return result;
        }
        tracing::warn!(pid = ?child.id(), "child ignored SIGTERM, sending SIGKILL");
        child.kill().await?;
        child.wait().await
    }
}
