//! 单个供应进程连接
//!
//! 持有子进程、stdin 写端与待决调用表。握手成功后启动后台读任务：逐行解析 stdout，
//! 按 id 把响应交给对应的 oneshot；stdout EOF 时把所有待决调用以 ProcessExited 结束。
//! 状态与待决表放在同一把锁下，状态检查与插入/移除是原子的。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::core::SupervisorError;
use crate::supervisor::child::shutdown_child;
use crate::supervisor::protocol::{encode_line, parse_incoming, Incoming, Method, RequestFrame, ResponseFrame};
use crate::supervisor::ServerConfig;

/// 连接状态：Starting -> Ready 每个进程实例至多一次；Stopped 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerStatus {
    Starting,
    Ready,
    Failed,
    Stopped,
}

type Reply = Result<ResponseFrame, SupervisorError>;

struct ConnState {
    status: ServerStatus,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
}

fn lock(state: &Mutex<ConnState>) -> MutexGuard<'_, ConnState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Connection {
    config: ServerConfig,
    state: Arc<Mutex<ConnState>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    /// 握手时取走，随后移交给读任务
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// 启动子进程（状态 Starting），尚未握手
    pub fn spawn(config: ServerConfig) -> Result<Arc<Self>, SupervisorError> {
        let spawn_err = |reason: String| SupervisorError::ProcessSpawn {
            server: config.name.clone(),
            reason,
        };

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(format!("'{}' {:?}: {}", config.command, config.args, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to get stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "{}", line);
                }
            });
        }

        tracing::info!(server = %config.name, pid = ?child.id(), command = %config.command, "provider spawned");

        Ok(Arc::new(Self {
            config,
            state: Arc::new(Mutex::new(ConnState {
                status: ServerStatus::Starting,
                pending: HashMap::new(),
            })),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(Some(child)),
            stdout: Mutex::new(Some(BufReader::new(stdout))),
            reader: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        lock(&self.state).status
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// 读取 stdout 直到 ready 帧；超时或 EOF 时进程被终止、状态置为 Failed
    pub async fn handshake(&self, startup_timeout: Duration) -> Result<(), SupervisorError> {
        let taken = self
            .stdout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let mut reader = taken.ok_or_else(|| SupervisorError::ProcessExited(self.name().to_string()))?;

        let name = self.name().to_string();
        let outcome = timeout(startup_timeout, async {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return Err(SupervisorError::ProcessExited(name.clone())),
                    Ok(_) => match parse_incoming(&line) {
                        Incoming::Ready => return Ok(()),
                        _ => tracing::debug!(server = %name, line = line.trim(), "skipping pre-ready output"),
                    },
                }
            }
        })
        .await;

        let err = match outcome {
            Ok(Ok(())) => {
                {
                    let mut st = lock(&self.state);
                    if st.status != ServerStatus::Starting {
                        return Err(SupervisorError::ProcessExited(name));
                    }
                    st.status = ServerStatus::Ready;
                }
                let handle = tokio::spawn(read_loop(name.clone(), Arc::clone(&self.state), reader));
                *self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
                tracing::info!(server = %name, "provider ready");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => SupervisorError::HandshakeTimeout {
                server: name.clone(),
                millis: startup_timeout.as_millis() as u64,
            },
        };

        {
            let mut st = lock(&self.state);
            if st.status != ServerStatus::Stopped {
                st.status = ServerStatus::Failed;
            }
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        tracing::warn!(server = %name, error = %err, "provider handshake failed");
        Err(err)
    }

    /// 发送请求并等待同 id 的响应；返回或 future 被丢弃时移除待决条目
    pub async fn request(
        &self,
        id: u64,
        method: Method,
        params: Value,
        tool: &str,
        call_timeout: Duration,
    ) -> Result<ResponseFrame, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = lock(&self.state);
            if st.status != ServerStatus::Ready {
                return Err(SupervisorError::ServerNotInitialized(self.name().to_string()));
            }
            st.pending.insert(id, tx);
        }
        let _pending = PendingGuard { state: &self.state, id };

        let frame = RequestFrame { id, method, params };
        let line = encode_line(&frame).map_err(|e| SupervisorError::MalformedResponse {
            server: self.name().to_string(),
            reason: format!("request encode failed: {}", e),
        })?;

        if let Err(e) = self.write_line(&line).await {
            tracing::warn!(server = %self.name(), error = %e, "write to provider failed");
            return Err(SupervisorError::ProcessExited(self.name().to_string()));
        }

        match timeout(call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SupervisorError::ProcessExited(self.name().to_string())),
            Err(_) => Err(SupervisorError::ToolCallTimeout {
                server: self.name().to_string(),
                tool: tool.to_string(),
                millis: call_timeout.as_millis() as u64,
            }),
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    /// 关闭：置 Stopped、关闭 stdin、SIGTERM/SIGKILL，并以 ProcessExited 结束所有待决调用。可重复调用。
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut st = lock(&self.state);
            st.status = ServerStatus::Stopped;
        }
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match shutdown_child(&mut child, grace).await {
                Ok(status) => tracing::info!(server = %self.name(), ?status, "provider stopped"),
                Err(e) => tracing::warn!(server = %self.name(), error = %e, "provider shutdown failed"),
            }
        }

        if let Some(handle) = self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
            handle.abort();
        }
        fail_pending(self.name(), &self.state);
    }
}

/// 请求存活期间持有；析构时移除待决条目（已被分发或清空的条目移除为空操作）
struct PendingGuard<'a> {
    state: &'a Mutex<ConnState>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).pending.remove(&self.id);
    }
}

/// 后台读任务：分发响应，EOF 后把连接置为 Failed（已 Stopped 的保持不变）
async fn read_loop(name: String, state: Arc<Mutex<ConnState>>, mut reader: BufReader<ChildStdout>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "provider stdout read failed");
                break;
            }
            Ok(_) => match parse_incoming(&line) {
                Incoming::Response(frame) => dispatch(&name, &state, frame),
                Incoming::Malformed { id, reason } => reject(&name, &state, id, reason),
                Incoming::Ready => tracing::debug!(server = %name, "duplicate ready frame"),
                Incoming::Other => tracing::debug!(server = %name, line = line.trim(), "skipping non-protocol output"),
            },
        }
    }

    {
        let mut st = lock(&state);
        if st.status != ServerStatus::Stopped {
            st.status = ServerStatus::Failed;
            tracing::warn!(server = %name, pending = st.pending.len(), "provider process exited");
        }
    }
    fail_pending(&name, &state);
}

fn dispatch(name: &str, state: &Mutex<ConnState>, frame: ResponseFrame) {
    let sender = lock(state).pending.remove(&frame.id);
    let Some(sender) = sender else {
        tracing::warn!(server = %name, id = frame.id, "response for unknown or expired call");
        return;
    };
    let reply = if frame.result.is_none() && frame.error.is_none() {
        Err(SupervisorError::MalformedResponse {
            server: name.to_string(),
            reason: format!("response {} has neither result nor error", frame.id),
        })
    } else {
        Ok(frame)
    };
    let _ = sender.send(reply);
}

fn reject(name: &str, state: &Mutex<ConnState>, id: u64, reason: String) {
    let Some(sender) = lock(state).pending.remove(&id) else {
        tracing::warn!(server = %name, id, "malformed response for unknown or expired call");
        return;
    };
    tracing::warn!(server = %name, id, reason = %reason, "malformed response");
    let _ = sender.send(Err(SupervisorError::MalformedResponse {
        server: name.to_string(),
        reason,
    }));
}

fn fail_pending(name: &str, state: &Mutex<ConnState>) {
    let drained: Vec<_> = lock(state).pending.drain().collect();
    for (_, sender) in drained {
        let _ = sender.send(Err(SupervisorError::ProcessExited(name.to_string())));
    }
}
