//! One-shot execution of the agent CLI.
//!
//! Each request spawns the agent once in non-interactive `stream-json` mode
//! and exposes its classified output as a lazy [`ChunkStream`]. The run lives
//! in its own task so the child is always reaped: on normal exit, timeout,
//! cancellation through the [`ConcurrencyGuard`], or when the consumer simply
//! drops the stream.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use agent_dash_error::SandboxError;
use futures::{Stream, StreamExt};
#[cfg(unix)]
use nix::sys::signal::Signal;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::ReceiverStream;

use crate::guard::{ActorKey, ConcurrencyGuard, ExecutionLease};
use crate::privilege::RunAsUser;
#[cfg(unix)]
use crate::process::signal_group;
use crate::stream::{Chunk, ChunkKind, StreamDecoder};

const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent CLI program name or path.
    pub agent_binary: String,
    /// Unprivileged user to run the agent as when the server is root.
    pub run_as: Option<String>,
    pub read_chunk_size: usize,
    /// Time between SIGTERM and SIGKILL when a run is stopped early.
    pub kill_grace: Duration,
    pub channel_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_binary: "claude".to_string(),
            run_as: Some("claude".to_string()),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            kill_grace: DEFAULT_KILL_GRACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    /// Resume the agent's most recent conversation in `working_dir`.
    pub continue_session: bool,
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: None,
            continue_session: false,
            timeout: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn continue_session(mut self, resume: bool) -> Self {
        self.continue_session = resume;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Arguments for a non-interactive, unattended agent run.
pub fn agent_args(prompt: &str, continue_session: bool) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];
    if continue_session {
        args.push("--continue".to_string());
    }
    args
}

#[derive(Debug, Clone)]
pub struct AgentExecutor {
    config: Arc<ExecutorConfig>,
    run_as: Option<RunAsUser>,
}

impl AgentExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let run_as = RunAsUser::resolve(config.run_as.as_deref());
        if let Some(user) = &run_as {
            tracing::info!(user = %user.name, uid = user.uid, "agent runs will be demoted");
        }
        Self {
            config: Arc::new(config),
            run_as,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start a run that is not tracked by any guard.
    pub fn execute(&self, request: ExecutionRequest) -> ChunkStream {
        self.spawn_run(request, None)
    }

    /// Start a run for `actor`, rejecting it if the actor already has one.
    pub fn execute_as(
        &self,
        guard: &Arc<ConcurrencyGuard>,
        actor: &ActorKey,
        request: ExecutionRequest,
    ) -> Result<ChunkStream, SandboxError> {
        let lease = guard.try_acquire(actor)?;
        Ok(self.execute_leased(lease, request))
    }

    /// Start a run under a lease the caller already holds.
    pub fn execute_leased(&self, lease: ExecutionLease, request: ExecutionRequest) -> ChunkStream {
        self.spawn_run(request, Some(lease))
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut command = Command::new(&self.config.agent_binary);
        command
            .args(agent_args(&request.prompt, request.continue_session))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(user) = &self.run_as {
                command.uid(user.uid).gid(user.gid).envs(user.env());
            }
        }
        command
    }

    fn spawn_run(&self, request: ExecutionRequest, mut lease: Option<ExecutionLease>) -> ChunkStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let command = self.build_command(&request);
        let run = AgentRun {
            program: self.config.agent_binary.clone(),
            read_chunk_size: self.config.read_chunk_size.max(1),
            kill_grace: self.config.kill_grace,
            timeout: request.timeout,
            cancel: lease.as_mut().and_then(ExecutionLease::take_cancel),
        };
        let actor = lease.as_ref().map(|lease| lease.actor().to_string());
        tracing::info!(
            actor = actor.as_deref().unwrap_or("-"),
            working_dir = ?request.working_dir,
            resume = request.continue_session,
            "starting agent run"
        );

        tokio::spawn(async move {
            run.drive(command, &tx).await;
            // Free the slot before the consumer can observe the end of the stream.
            drop(lease);
            drop(tx);
        });

        ChunkStream {
            inner: ReceiverStream::new(rx),
        }
    }
}

/// Lazily produced chunks of one agent run.
#[derive(Debug)]
pub struct ChunkStream {
    inner: ReceiverStream<Chunk>,
}

impl Stream for ChunkStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

enum Interrupt {
    TimedOut,
    Cancelled,
    Abandoned,
}

struct AgentRun {
    program: String,
    read_chunk_size: usize,
    kill_grace: Duration,
    timeout: Option<Duration>,
    cancel: Option<oneshot::Receiver<()>>,
}

impl AgentRun {
    async fn drive(mut self, mut command: Command, tx: &mpsc::Sender<Chunk>) {
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(program = %self.program, error = %err, "failed to spawn agent");
                let _ = tx
                    .send(Chunk::error(format!(
                        "Error: failed to start {}: {err}",
                        self.program
                    )))
                    .await;
                return;
            }
        };
        let pid = child.id();
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let stdout = child.stdout.take();
        let read_chunk_size = self.read_chunk_size;
        let pump = async {
            let mut decoder = StreamDecoder::new();
            if let Some(mut stdout) = stdout {
                let mut buf = vec![0u8; read_chunk_size];
                loop {
                    let n = match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(err) => {
                            tracing::warn!(error = %err, "agent stdout read failed");
                            break;
                        }
                    };
                    for chunk in decoder.push(&buf[..n]) {
                        if tx.send(chunk).await.is_err() {
                            return false;
                        }
                    }
                }
            }
            for chunk in decoder.finish() {
                if tx.send(chunk).await.is_err() {
                    return false;
                }
            }
            true
        };

        let delivered = tokio::select! {
            delivered = pump => delivered,
            interrupt = wait_interrupt(deadline, &mut self.cancel, tx) => {
                self.stop(&mut child, interrupt, tx).await;
                return;
            }
        };
        if !delivered {
            self.stop(&mut child, Interrupt::Abandoned, tx).await;
            return;
        }

        let status = tokio::select! {
            status = child.wait() => status,
            interrupt = wait_interrupt(deadline, &mut self.cancel, tx) => {
                self.stop(&mut child, interrupt, tx).await;
                return;
            }
        };

        match status {
            Ok(status) if status.success() => {
                tracing::info!(pid = ?pid, "agent run finished");
            }
            Ok(status) => {
                tracing::warn!(pid = ?pid, code = ?status.code(), "agent exited with failure");
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => Vec::new(),
                };
                if !stderr.is_empty() {
                    let _ = tx
                        .send(Chunk::error(String::from_utf8_lossy(&stderr).into_owned()))
                        .await;
                }
            }
            Err(err) => {
                tracing::warn!(pid = ?pid, error = %err, "failed to wait for agent");
                let _ = tx
                    .send(Chunk::error(format!("Error: failed to wait for agent: {err}")))
                    .await;
            }
        }
    }

    async fn stop(&self, child: &mut Child, interrupt: Interrupt, tx: &mpsc::Sender<Chunk>) {
        terminate_child(child, self.kill_grace).await;
        match interrupt {
            Interrupt::TimedOut => {
                let timeout = self.timeout.unwrap_or_default();
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "agent run timed out");
                let _ = tx
                    .send(Chunk::error(format!(
                        "Error: execution timed out after {}",
                        format_timeout(timeout)
                    )))
                    .await;
            }
            Interrupt::Cancelled => {
                tracing::info!("agent run cancelled");
                let _ = tx.send(Chunk::error("Cancelled.")).await;
            }
            Interrupt::Abandoned => {
                tracing::debug!("agent output abandoned by consumer");
            }
        }
    }
}

fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

async fn wait_interrupt(
    deadline: Option<Instant>,
    cancel: &mut Option<oneshot::Receiver<()>>,
    tx: &mpsc::Sender<Chunk>,
) -> Interrupt {
    let timed_out = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    let cancelled = async {
        if let Some(rx) = cancel.as_mut() {
            if rx.await.is_ok() {
                return;
            }
            // A closed channel means the lease was released, not a cancel.
            *cancel = None;
        }
        std::future::pending::<()>().await
    };
    tokio::select! {
        _ = timed_out => Interrupt::TimedOut,
        _ = cancelled => Interrupt::Cancelled,
        _ = tx.closed() => Interrupt::Abandoned,
    }
}

/// SIGTERM the child's process group, then SIGKILL after `grace`, and reap.
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::SIGTERM);
        if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
            return;
        }
        signal_group(pid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "kill after grace period failed");
    }
}

/// Accumulates chunks into the final answer of a run.
///
/// The authoritative `result` chunk wins; otherwise everything else is
/// joined.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    final_result: Option<String>,
    parts: Vec<String>,
    saw_error: bool,
}

impl ResponseBuilder {
    pub fn push(&mut self, chunk: &Chunk) {
        match chunk.kind {
            ChunkKind::Result => self.final_result = Some(chunk.content.clone()),
            ChunkKind::Error => {
                self.saw_error = true;
                self.parts.push(chunk.content.clone());
            }
            _ => self.parts.push(chunk.content.clone()),
        }
    }

    /// Whether any error chunk (failure, timeout, cancel) was seen.
    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    pub fn finish(self) -> String {
        if let Some(result) = self.final_result.filter(|result| !result.trim().is_empty()) {
            return result;
        }
        let joined = self.parts.join("\n");
        if joined.trim().is_empty() {
            "(no output)".to_string()
        } else {
            joined
        }
    }
}

/// Reduce a run to its final answer.
pub async fn collect_response<S>(mut stream: S) -> String
where
    S: Stream<Item = Chunk> + Unpin,
{
    let mut response = ResponseBuilder::default();
    while let Some(chunk) = stream.next().await {
        response.push(&chunk);
    }
    response.finish()
}
