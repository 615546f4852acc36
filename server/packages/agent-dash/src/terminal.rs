//! Line-oriented command terminal.
//!
//! Each connection keeps a working directory; every command line runs as its
//! own shell subprocess (no PTY) with stdout and stderr sharing one pipe and
//! streamed back as they arrive.
//! `cd` is handled in-process so the directory survives between commands.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

#[cfg(unix)]
use crate::process::GroupKillGuard;

/// Substrings that refuse a command outright (matched case-insensitively).
pub const BLOCKED_COMMANDS: [&str; 6] = [
    "rm -rf /",
    "rm -rf /*",
    "mkfs",
    ":(){:|:&};:",
    "dd if=/dev/zero of=/dev/sda",
    "chmod -R 777 /",
];

pub const BLOCKED_NOTICE: &str = "Blocked: this command is not allowed for safety reasons.\n";

const READ_CHUNK_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalEvent {
    Prompt { cwd: String },
    Output { content: String },
    Exit { code: i32, cwd: String },
}

impl TerminalEvent {
    fn output(content: impl Into<String>) -> Self {
        TerminalEvent::Output {
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalRequest {
    Command { content: String },
    #[serde(other)]
    Other,
}

pub fn is_blocked(command: &str) -> bool {
    let command = command.trim().to_lowercase();
    BLOCKED_COMMANDS
        .iter()
        .any(|blocked| command.contains(&blocked.to_lowercase()))
}

#[derive(Debug, Clone)]
pub struct TerminalState {
    cwd: PathBuf,
    home: PathBuf,
}

impl TerminalState {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            cwd: home.clone(),
            home,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn cwd_string(&self) -> String {
        self.cwd.to_string_lossy().into_owned()
    }

    pub fn prompt(&self) -> TerminalEvent {
        TerminalEvent::Prompt {
            cwd: self.cwd_string(),
        }
    }

    fn exit(&self, code: i32) -> TerminalEvent {
        TerminalEvent::Exit {
            code,
            cwd: self.cwd_string(),
        }
    }

    /// Resolve `target` like a shell `cd` would; the cwd only changes on
    /// success.
    pub fn change_dir(&mut self, target: Option<&str>) -> std::io::Result<&Path> {
        let path = match target {
            None | Some("~") => self.home.clone(),
            Some(target) => match target.strip_prefix("~/") {
                Some(rest) => self.home.join(rest),
                None => self.cwd.join(target),
            },
        };
        let resolved = std::fs::canonicalize(path)?;
        if !resolved.is_dir() {
            return Err(std::io::ErrorKind::NotFound.into());
        }
        self.cwd = resolved;
        Ok(&self.cwd)
    }

    /// Run one command line, emitting `output` events and a final `exit`.
    pub async fn handle_command<S>(&mut self, command: &str, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink<TerminalEvent> + Unpin,
    {
        let command = command.trim();
        if command.is_empty() {
            return sink.send(self.prompt()).await;
        }

        if is_blocked(command) {
            tracing::warn!(cwd = %self.cwd.display(), "blocked terminal command");
            sink.send(TerminalEvent::output(BLOCKED_NOTICE)).await?;
            return sink.send(self.exit(1)).await;
        }

        if command == "cd" || command.starts_with("cd ") {
            let target = command[2..].trim();
            let target = (!target.is_empty()).then_some(target);
            return match self.change_dir(target) {
                Ok(_) => sink.send(self.exit(0)).await,
                Err(_) => {
                    sink.send(TerminalEvent::output(format!(
                        "cd: no such file or directory: {}\n",
                        target.unwrap_or("~")
                    )))
                    .await?;
                    sink.send(self.exit(1)).await
                }
            };
        }

        self.run_shell(command, sink).await
    }

    async fn run_shell<S>(&mut self, command: &str, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink<TerminalEvent> + Unpin,
    {
        tracing::debug!(cwd = %self.cwd.display(), "running terminal command");
        let mut cmd = shell_command(command);
        cmd.current_dir(&self.cwd)
            .env("TERM", "dumb")
            .env("COLUMNS", "120")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let (mut child, mut output) = match spawn_merged(cmd) {
            Ok(spawned) => spawned,
            Err(err) => {
                sink.send(TerminalEvent::output(format!("Error: {err}\n"))).await?;
                return sink.send(self.exit(1)).await;
            }
        };
        // Dropping this future (client gone) takes the whole group down.
        #[cfg(unix)]
        let mut group = GroupKillGuard::new(child.id());

        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut tail = Vec::new();
        loop {
            let n = match output.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(error = %err, "terminal output read failed");
                    break;
                }
            };
            let text = decode_utf8(&mut tail, &buf[..n]);
            if !text.is_empty() {
                sink.send(TerminalEvent::output(text)).await?;
            }
        }
        if !tail.is_empty() {
            let text = String::from_utf8_lossy(&tail).into_owned();
            sink.send(TerminalEvent::output(text)).await?;
        }

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                tracing::warn!(error = %err, "failed to wait for terminal command");
                -1
            }
        };
        #[cfg(unix)]
        group.disarm();
        sink.send(self.exit(code)).await
    }
}

type MergedOutput = Box<dyn AsyncRead + Send + Unpin>;

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(format!("({command}) 2>&1"));
    cmd
}

/// Spawn `cmd` as its own process group with stdout and stderr sharing a
/// single pipe, so the reader sees writes in the order they were made.
#[cfg(unix)]
fn spawn_merged(mut cmd: Command) -> std::io::Result<(Child, MergedOutput)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read_end, write_end) = nix::unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    cmd.stdout(Stdio::from(write_end.try_clone()?))
        .stderr(Stdio::from(write_end))
        .process_group(0);
    let child = cmd.spawn()?;
    // Our copies of the write end live in `cmd`; EOF needs them closed.
    drop(cmd);
    let reader = tokio::net::unix::pipe::Receiver::from_owned_fd(read_end)?;
    Ok((child, Box::new(reader)))
}

#[cfg(windows)]
fn spawn_merged(mut cmd: Command) -> std::io::Result<(Child, MergedOutput)> {
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    Ok((child, Box::new(stdout)))
}

/// Decode `bytes` after any carried-over partial sequence, keeping an
/// incomplete trailing sequence in `pending` for the next read.
fn decode_utf8(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let mut out = String::new();
    let mut rest: &[u8] = pending;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                rest = &[];
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let carried = rest.to_vec();
    *pending = carried;
    out
}

fn parse_request(raw: &str) -> Result<Option<String>, serde_json::Error> {
    Ok(match serde_json::from_str::<TerminalRequest>(raw)? {
        TerminalRequest::Command { content } => Some(content),
        TerminalRequest::Other => None,
    })
}

enum Step {
    Continue,
    Stop,
}

/// Drive a command terminal for one connection until the client leaves.
///
/// Messages that arrive while a command runs are queued; the client going
/// away kills the running command.
pub async fn run_terminal_session<O, I>(home: PathBuf, mut outbound: O, mut inbound: I)
where
    O: Sink<TerminalEvent> + Unpin,
    I: Stream<Item = String> + Unpin,
{
    let mut state = TerminalState::new(home);
    if outbound.send(state.prompt()).await.is_err() {
        return;
    }

    let mut queued = VecDeque::new();
    loop {
        let raw = match queued.pop_front() {
            Some(raw) => raw,
            None => match inbound.next().await {
                Some(raw) => raw,
                None => break,
            },
        };
        let command = match parse_request(&raw) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "malformed terminal message");
                if outbound
                    .send(TerminalEvent::output(format!("Error: invalid message: {err}\n")))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        let step = {
            let work = state.handle_command(&command, &mut outbound);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    result = &mut work => {
                        break if result.is_ok() { Step::Continue } else { Step::Stop };
                    }
                    next = inbound.next() => match next {
                        Some(raw) => queued.push_back(raw),
                        None => break Step::Stop,
                    },
                }
            }
        };
        if matches!(step, Step::Stop) {
            break;
        }
    }
    tracing::debug!(cwd = %state.cwd().display(), "terminal session ended");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn canonical_tempdir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = std::fs::canonicalize(dir.path()).unwrap();
        (dir, path)
    }

    fn output_text(events: &[TerminalEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                TerminalEvent::Output { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn blocklist_is_case_insensitive_substring() {
        assert!(is_blocked("sudo RM -RF / --no-preserve-root"));
        assert!(is_blocked("  mkfs.ext4 /dev/sdb1"));
        assert!(is_blocked("CHMOD -r 777 /"));
        assert!(!is_blocked("rm -rf build"));
        assert!(!is_blocked("ls -la"));
    }

    #[tokio::test]
    async fn cd_parent_moves_up() {
        let (_dir, root) = canonical_tempdir();
        let home = root.join("x");
        std::fs::create_dir(&home).unwrap();
        let mut state = TerminalState::new(&home);

        let mut events = Vec::new();
        state.handle_command("cd ..", &mut events).await.unwrap();
        assert_eq!(state.cwd(), root.as_path());
        assert_eq!(
            events,
            vec![TerminalEvent::Exit {
                code: 0,
                cwd: root.to_string_lossy().into_owned()
            }]
        );
    }

    #[tokio::test]
    async fn cd_missing_keeps_cwd() {
        let (_dir, home) = canonical_tempdir();
        let mut state = TerminalState::new(&home);

        let mut events = Vec::new();
        state.handle_command("cd nope", &mut events).await.unwrap();
        assert_eq!(state.cwd(), home.as_path());
        assert_eq!(
            events,
            vec![
                TerminalEvent::Output {
                    content: "cd: no such file or directory: nope\n".to_string()
                },
                TerminalEvent::Exit {
                    code: 1,
                    cwd: home.to_string_lossy().into_owned()
                },
            ]
        );
    }

    #[test]
    fn cd_home_forms() {
        let (_dir, home) = canonical_tempdir();
        std::fs::create_dir(home.join("proj")).unwrap();
        std::fs::write(home.join("file.txt"), "x").unwrap();
        let mut state = TerminalState::new(&home);

        state.change_dir(Some("proj")).unwrap();
        assert_eq!(state.cwd(), home.join("proj"));
        state.change_dir(None).unwrap();
        assert_eq!(state.cwd(), home);
        state.change_dir(Some("~/proj")).unwrap();
        assert_eq!(state.cwd(), home.join("proj"));
        state.change_dir(Some("~")).unwrap();
        assert_eq!(state.cwd(), home);
        assert!(state.change_dir(Some("file.txt")).is_err());
        assert_eq!(state.cwd(), home);
    }

    #[tokio::test]
    async fn blocked_command_never_spawns() {
        let (_dir, home) = canonical_tempdir();
        let marker = home.join("marker");
        let mut state = TerminalState::new(&home);

        let mut events = Vec::new();
        let command = format!("touch {} && RM -RF /", marker.display());
        state.handle_command(&command, &mut events).await.unwrap();
        assert!(!marker.exists());
        assert_eq!(output_text(&events), BLOCKED_NOTICE);
        assert!(matches!(events.last(), Some(TerminalEvent::Exit { code: 1, .. })));
    }

    #[tokio::test]
    async fn runs_in_cwd_and_merges_stderr() {
        let (_dir, home) = canonical_tempdir();
        let mut state = TerminalState::new(&home);

        let mut events = Vec::new();
        state
            .handle_command("pwd; echo oops 1>&2; echo \"$TERM $COLUMNS\"", &mut events)
            .await
            .unwrap();
        let text = output_text(&events);
        assert!(text.contains(&*home.to_string_lossy()));
        assert!(text.contains("oops"));
        assert!(text.contains("dumb 120"));
        assert_eq!(
            events.last(),
            Some(&TerminalEvent::Exit {
                code: 0,
                cwd: home.to_string_lossy().into_owned()
            })
        );
    }

    #[tokio::test]
    async fn interleaved_stdout_and_stderr_keep_their_order() {
        let (_dir, home) = canonical_tempdir();
        let mut state = TerminalState::new(&home);

        let mut events = Vec::new();
        let command = "i=0; while [ $i -lt 200 ]; do echo o$i; echo e$i >&2; i=$((i+1)); done";
        state.handle_command(command, &mut events).await.unwrap();

        let expected: String = (0..200).map(|i| format!("o{i}\ne{i}\n")).collect();
        assert_eq!(output_text(&events), expected);
        assert!(matches!(events.last(), Some(TerminalEvent::Exit { code: 0, .. })));
    }

    #[tokio::test]
    async fn spawn_failure_reports_error_and_exit_one() {
        let (_dir, root) = canonical_tempdir();
        let gone = root.join("gone");
        std::fs::create_dir(&gone).unwrap();
        let mut state = TerminalState::new(&root);
        state.change_dir(Some("gone")).unwrap();
        std::fs::remove_dir(&gone).unwrap();

        let mut events = Vec::new();
        state.handle_command("echo hi", &mut events).await.unwrap();
        assert_eq!(events.len(), 2, "{events:?}");
        assert!(matches!(
            &events[0],
            TerminalEvent::Output { content }
                if content.starts_with("Error: ") && content.ends_with('\n') && content.len() > "Error: \n".len()
        ));
        assert_eq!(
            events[1],
            TerminalEvent::Exit {
                code: 1,
                cwd: gone.to_string_lossy().into_owned()
            }
        );
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let (_dir, home) = canonical_tempdir();
        let mut state = TerminalState::new(&home);
        let mut events = Vec::new();
        state.handle_command("exit 3", &mut events).await.unwrap();
        assert!(matches!(events.last(), Some(TerminalEvent::Exit { code: 3, .. })));
    }

    #[tokio::test]
    async fn empty_command_reprompts() {
        let (_dir, home) = canonical_tempdir();
        let mut state = TerminalState::new(&home);
        let mut events = Vec::new();
        state.handle_command("   ", &mut events).await.unwrap();
        assert_eq!(events, vec![state.prompt()]);
    }

    #[test]
    fn utf8_split_across_reads_is_carried() {
        let bytes = "héllo".as_bytes();
        let mut pending = Vec::new();
        let first = decode_utf8(&mut pending, &bytes[..2]);
        assert_eq!(first, "h");
        assert_eq!(pending.len(), 1);
        let second = decode_utf8(&mut pending, &bytes[2..]);
        assert_eq!(second, "éllo");
        assert!(pending.is_empty());

        assert_eq!(decode_utf8(&mut pending, b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(TerminalEvent::Exit {
            code: 0,
            cwd: "/home".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "exit", "code": 0, "cwd": "/home"}));
    }

    #[tokio::test]
    async fn session_handles_protocol_errors_and_commands() {
        use futures::channel::mpsc;

        let (_dir, home) = canonical_tempdir();
        let (in_tx, in_rx) = mpsc::unbounded::<String>();
        let (out_tx, mut out_rx) = mpsc::unbounded::<TerminalEvent>();
        let session = tokio::spawn(run_terminal_session(home.clone(), out_tx, in_rx));

        for raw in [
            "not json",
            r#"{"type":"ping"}"#,
            r#"{"type":"command","content":"echo hi"}"#,
        ] {
            in_tx.unbounded_send(raw.to_string()).unwrap();
        }

        let mut events = Vec::new();
        while !matches!(events.last(), Some(TerminalEvent::Exit { .. })) {
            let event = tokio::time::timeout(std::time::Duration::from_secs(10), out_rx.next())
                .await
                .unwrap()
                .expect("session still open");
            events.push(event);
        }
        drop(in_tx);
        session.await.unwrap();

        assert_eq!(events[0], TerminalEvent::Prompt { cwd: home.to_string_lossy().into_owned() });
        assert!(matches!(
            &events[1],
            TerminalEvent::Output { content } if content.starts_with("Error: invalid message")
        ));
        assert_eq!(output_text(&events[2..]), "hi\n");
        assert!(matches!(events.last(), Some(TerminalEvent::Exit { code: 0, .. })));
    }

    #[tokio::test]
    async fn disconnect_kills_background_jobs_of_the_command() {
        use futures::channel::mpsc;

        let (_dir, home) = canonical_tempdir();
        let pidfile = home.join("bg.pid");
        let (in_tx, in_rx) = mpsc::unbounded::<String>();
        let (out_tx, _out_rx) = mpsc::unbounded::<TerminalEvent>();
        let session = tokio::spawn(run_terminal_session(home.clone(), out_tx, in_rx));

        let command = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
        in_tx
            .unbounded_send(serde_json::json!({"type": "command", "content": command}).to_string())
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        let pid: u32 = loop {
            let written = std::fs::read_to_string(&pidfile).unwrap_or_default();
            if written.ends_with('\n') {
                break written.trim().parse().unwrap();
            }
            assert!(std::time::Instant::now() < deadline, "pid file never written");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        };
        assert!(crate::process::is_running(pid));

        drop(in_tx);
        tokio::time::timeout(std::time::Duration::from_secs(10), session)
            .await
            .expect("session ends on disconnect")
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while crate::process::is_running(pid) {
            assert!(std::time::Instant::now() < deadline, "background sleep survived disconnect");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn disconnect_kills_running_command() {
        let (_dir, home) = canonical_tempdir();
        let inbound = futures::stream::iter(vec![
            r#"{"type":"command","content":"sleep 30"}"#.to_string(),
        ]);
        let mut events = Vec::new();
        let started = std::time::Instant::now();
        run_terminal_session(home, &mut events, inbound).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(events.len(), 1);
    }
}
