//! Interactive pseudo-terminal sessions.
//!
//! # Lifecycle
//!
//! A [`PtySession`] is opened when a client connects and owns exactly one
//! child process attached to the subordinate side of a pseudo-terminal.
//! [`PtySession::run`] bridges the controlling side to the client until
//! either direction ends, then tears the child down:
//!
//! 1. the controlling descriptor is closed,
//! 2. SIGHUP goes to the child's process group,
//! 3. after a short grace period SIGKILL follows if it is still alive,
//! 4. the child is reaped on a blocking worker.
//!
//! # Backends
//!
//! - [`PtyBackend::Native`] (unix): `openpty` with readiness-based I/O.
//! - [`PtyBackend::Portable`]: `portable-pty` with a reader thread.

#[cfg(unix)]
mod native;
mod portable;

use std::fmt;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent_dash_error::SandboxError;
use futures::{Sink, SinkExt, Stream, StreamExt};
#[cfg(unix)]
use nix::sys::signal::Signal;
use portable_pty::MasterPty;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::privilege::RunAsUser;
#[cfg(unix)]
use crate::process::signal_group;

pub(crate) const READ_BUFFER_SIZE: usize = 4096;
/// Largest piece of output forwarded to the client in one message.
pub const SEND_CHUNK_SIZE: usize = 1024;
pub const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    rows: u16,
    cols: u16,
}

impl PtySize {
    pub const DEFAULT: PtySize = PtySize { rows: 24, cols: 80 };

    /// `None` if either dimension is zero.
    pub fn new(rows: u16, cols: u16) -> Option<Self> {
        (rows > 0 && cols > 0).then_some(Self { rows, cols })
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

impl PtyInput {
    /// Interpret a text frame: a resize control message, or raw keystrokes.
    ///
    /// A frame tagged as a control message but carrying unusable fields is
    /// dropped rather than typed into the terminal.
    pub fn from_text(text: String) -> Option<Self> {
        let control = match serde_json::from_str::<Value>(&text) {
            Ok(value @ Value::Object(_)) if value.get("type").and_then(Value::as_str) == Some("resize") => {
                value
            }
            _ => return Some(PtyInput::Data(text.into_bytes())),
        };
        match serde_json::from_value::<ControlMessage>(control) {
            Ok(ControlMessage::Resize { cols, rows }) => Some(PtyInput::Resize { cols, rows }),
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed resize message");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyBackend {
    Native,
    Portable,
}

impl Default for PtyBackend {
    fn default() -> Self {
        if cfg!(unix) {
            PtyBackend::Native
        } else {
            PtyBackend::Portable
        }
    }
}

impl fmt::Display for PtyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PtyBackend::Native => "native",
            PtyBackend::Portable => "portable",
        })
    }
}

impl FromStr for PtyBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "native" => Ok(PtyBackend::Native),
            "portable" => Ok(PtyBackend::Portable),
            other => Err(format!("unknown pty backend `{other}` (expected native or portable)")),
        }
    }
}

/// Program, arguments and environment of the process behind a session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub run_as: Option<RunAsUser>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
            ],
            cwd: None,
            run_as: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn run_as(mut self, user: Option<RunAsUser>) -> Self {
        self.run_as = user;
        self
    }

    /// The agent REPL when the agent is installed, otherwise a login shell.
    pub fn interactive(agent_binary: &str, shell: &str, run_as: Option<RunAsUser>) -> Self {
        let spec = match which::which(agent_binary) {
            Ok(path) => LaunchSpec::new(path.to_string_lossy())
                .args(["--dangerously-skip-permissions"]),
            Err(_) => {
                tracing::info!(agent = %agent_binary, shell = %shell, "agent not on PATH; opening shell");
                LaunchSpec::new(shell).args(["--login"])
            }
        };
        spec.run_as(run_as)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

enum PtyReader {
    #[cfg(unix)]
    Native {
        controller: native::Controller,
        buf: Vec<u8>,
    },
    Portable(mpsc::Receiver<Vec<u8>>),
}

impl PtyReader {
    /// Next block of output, `None` once the child side hung up.
    async fn next(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            #[cfg(unix)]
            PtyReader::Native { controller, buf } => {
                let n = native::read(controller, buf).await?;
                Ok((n > 0).then(|| buf[..n].to_vec()))
            }
            PtyReader::Portable(rx) => Ok(rx.recv().await),
        }
    }
}

enum PtyWriter {
    #[cfg(unix)]
    Native(native::Controller),
    Portable {
        writer: Box<dyn io::Write + Send>,
        master: Box<dyn MasterPty + Send>,
    },
}

impl PtyWriter {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PtyWriter::Native(controller) => native::write_all(controller, data).await,
            PtyWriter::Portable { writer, .. } => {
                writer.write_all(data)?;
                writer.flush()
            }
        }
    }

    fn resize(&self, size: PtySize) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PtyWriter::Native(controller) => native::set_size(controller.get_ref(), size),
            PtyWriter::Portable { master, .. } => portable::resize(&**master, size),
        }
    }
}

enum PtyChild {
    #[cfg(unix)]
    Native(std::process::Child),
    Portable(Box<dyn portable_pty::Child + Send + Sync>),
}

impl PtyChild {
    fn pid(&self) -> Option<u32> {
        match self {
            #[cfg(unix)]
            PtyChild::Native(child) => Some(child.id()),
            PtyChild::Portable(child) => child.process_id(),
        }
    }

    fn has_exited(&mut self) -> bool {
        match self {
            #[cfg(unix)]
            PtyChild::Native(child) => !matches!(child.try_wait(), Ok(None)),
            PtyChild::Portable(child) => !matches!(child.try_wait(), Ok(None)),
        }
    }

    fn hang_up(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            signal_group(pid, Signal::SIGHUP);
            return;
        }
        self.kill();
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            signal_group(pid, Signal::SIGKILL);
        }
        let result = match self {
            #[cfg(unix)]
            PtyChild::Native(child) => child.kill(),
            PtyChild::Portable(child) => child.kill(),
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "kill on pty child failed");
        }
    }

    /// Blocks until the child is reaped.
    fn wait(self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PtyChild::Native(mut child) => child.wait().map(drop),
            PtyChild::Portable(mut child) => child.wait().map(drop),
        }
    }
}

/// One client's interactive terminal.
pub struct PtySession {
    owner: String,
    backend: PtyBackend,
    size: PtySize,
    state: SessionState,
    pid: Option<u32>,
    reader: Option<PtyReader>,
    writer: Option<PtyWriter>,
    child: Option<PtyChild>,
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession")
            .field("owner", &self.owner)
            .field("backend", &self.backend)
            .field("size", &self.size)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish()
    }
}

impl PtySession {
    pub fn open(
        backend: PtyBackend,
        launch: &LaunchSpec,
        size: PtySize,
        owner: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let owner = owner.into();
        let spawn_failed = |err: io::Error| SandboxError::SpawnFailed {
            program: launch.program.clone(),
            message: err.to_string(),
        };

        let (reader, writer, child) = match backend {
            #[cfg(unix)]
            PtyBackend::Native => {
                let (controller, child) = native::spawn(launch, size).map_err(spawn_failed)?;
                (
                    PtyReader::Native {
                        controller: controller.clone(),
                        buf: vec![0; READ_BUFFER_SIZE],
                    },
                    PtyWriter::Native(controller),
                    PtyChild::Native(child),
                )
            }
            #[cfg(not(unix))]
            PtyBackend::Native => {
                return Err(SandboxError::InvalidRequest {
                    message: "native pty backend requires a unix platform".to_string(),
                });
            }
            PtyBackend::Portable => {
                let spawned = portable::spawn(launch, size).map_err(spawn_failed)?;
                (
                    PtyReader::Portable(spawned.output),
                    PtyWriter::Portable {
                        writer: spawned.writer,
                        master: spawned.master,
                    },
                    PtyChild::Portable(spawned.child),
                )
            }
        };

        let pid = child.pid();
        tracing::info!(
            owner = %owner,
            %backend,
            program = %launch.program,
            pid = ?pid,
            rows = size.rows(),
            cols = size.cols(),
            "pty session opened"
        );
        Ok(Self {
            owner,
            backend,
            size,
            state: SessionState::Open,
            pid,
            reader: Some(reader),
            writer: Some(writer),
            child: Some(child),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> PtySize {
        self.size
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bridge the terminal to a client until either side ends, then tear
    /// the child down.
    pub async fn run<O, I>(&mut self, mut outbound: O, mut inbound: I)
    where
        O: Sink<Vec<u8>> + Unpin,
        I: Stream<Item = PtyInput> + Unpin,
    {
        let (Some(mut reader), Some(mut writer)) = (self.reader.take(), self.writer.take()) else {
            return;
        };
        let pid = self.pid;
        let mut size = self.size;

        let reason = {
            let output = async {
                loop {
                    match reader.next().await {
                        Ok(Some(data)) => {
                            for piece in data.chunks(SEND_CHUNK_SIZE) {
                                if outbound.send(piece.to_vec()).await.is_err() {
                                    return "client channel closed";
                                }
                            }
                        }
                        Ok(None) => return "terminal closed",
                        Err(err) => {
                            tracing::debug!(error = %err, "pty read failed");
                            return "terminal read failed";
                        }
                    }
                }
            };
            let input = async {
                while let Some(message) = inbound.next().await {
                    match message {
                        PtyInput::Data(bytes) => {
                            if let Err(err) = writer.write_all(&bytes).await {
                                tracing::debug!(error = %err, "pty write failed");
                                return "terminal write failed";
                            }
                        }
                        PtyInput::Resize { cols, rows } => {
                            let Some(next) = PtySize::new(rows, cols) else {
                                tracing::debug!(rows, cols, "ignoring zero-sized resize");
                                continue;
                            };
                            if let Err(err) = writer.resize(next) {
                                tracing::warn!(error = %err, "failed to resize pty");
                                continue;
                            }
                            size = next;
                            #[cfg(unix)]
                            if let Some(pid) = pid {
                                signal_group(pid, Signal::SIGWINCH);
                            }
                        }
                    }
                }
                "client disconnected"
            };
            tokio::select! {
                reason = output => reason,
                reason = input => reason,
            }
        };

        self.size = size;
        self.state = SessionState::Closing;
        tracing::debug!(owner = %self.owner, pid = ?pid, reason, "pty session closing");
        drop(reader);
        drop(writer);
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if !child.has_exited() {
                child.hang_up();
                tokio::time::sleep(TEARDOWN_GRACE).await;
                if !child.has_exited() {
                    child.kill();
                }
            }
            match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "failed to reap pty child"),
                Err(err) => tracing::warn!(error = %err, "pty reaper task failed"),
            }
        }
        self.state = SessionState::Closed;
        tracing::info!(owner = %self.owner, pid = ?self.pid, "pty session closed");
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        // Only reached with a live child if `run` never completed.
        self.reader.take();
        self.writer.take();
        if let Some(mut child) = self.child.take() {
            if !child.has_exited() {
                child.kill();
            }
            let _ = std::thread::Builder::new()
                .name("pty-reaper".to_string())
                .spawn(move || child.wait());
        }
    }
}
