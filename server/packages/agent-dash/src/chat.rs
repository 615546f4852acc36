//! Dashboard chat channel: one-shot agent runs streamed to a WebSocket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::executor::{AgentExecutor, ExecutionRequest, ResponseBuilder};
use crate::guard::{ActorKey, ConcurrencyGuard};
use crate::stream::ChunkKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Chunk { content: String, chunk_type: ChunkKind },
    Done { result: String },
    Error { message: String },
}

impl ChatEvent {
    fn error(message: impl Into<String>) -> Self {
        ChatEvent::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatRequest {
    Message {
        content: String,
        #[serde(default)]
        work_dir: Option<PathBuf>,
        #[serde(default, rename = "continue")]
        resume: bool,
    },
    Cancel,
    /// Start a fresh agent conversation on the next message.
    Reset,
    #[serde(other)]
    Other,
}

/// Shared settings for every chat connection.
#[derive(Debug, Clone)]
pub struct ChatChannel {
    executor: AgentExecutor,
    guard: Arc<ConcurrencyGuard>,
    default_work_dir: PathBuf,
    timeout: Option<Duration>,
}

enum Flow {
    Continue,
    Disconnected,
}

impl ChatChannel {
    pub fn new(
        executor: AgentExecutor,
        guard: Arc<ConcurrencyGuard>,
        default_work_dir: PathBuf,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            guard,
            default_work_dir,
            timeout,
        }
    }

    /// Serve one connection for `user` until the client goes away.
    ///
    /// Dropping out mid-run drops the chunk stream, which terminates the
    /// agent process.
    pub async fn run<O, I>(&self, user: &str, mut outbound: O, mut inbound: I)
    where
        O: Sink<ChatEvent> + Unpin,
        I: Stream<Item = String> + Unpin,
    {
        let actor = ActorKey::chat(user);
        while let Some(raw) = inbound.next().await {
            let flow = match serde_json::from_str::<ChatRequest>(&raw) {
                Ok(ChatRequest::Message {
                    content,
                    work_dir,
                    resume,
                }) => {
                    self.handle_message(&actor, content, work_dir, resume, &mut outbound, &mut inbound)
                        .await
                }
                Ok(request) => self.handle_control(&actor, request, &mut outbound).await,
                Err(err) => send(&mut outbound, ChatEvent::error(format!("invalid message: {err}"))).await,
            };
            if matches!(flow, Flow::Disconnected) {
                break;
            }
        }
        tracing::debug!(actor = %actor, "chat connection closed");
    }

    async fn handle_control<O>(&self, actor: &ActorKey, request: ChatRequest, outbound: &mut O) -> Flow
    where
        O: Sink<ChatEvent> + Unpin,
    {
        match request {
            ChatRequest::Cancel => {
                if self.guard.cancel(actor) {
                    Flow::Continue
                } else {
                    send(outbound, ChatEvent::error("No task is running.")).await
                }
            }
            ChatRequest::Reset => {
                self.guard.reset_session(actor);
                Flow::Continue
            }
            ChatRequest::Message { .. } | ChatRequest::Other => Flow::Continue,
        }
    }

    async fn handle_message<O, I>(
        &self,
        actor: &ActorKey,
        content: String,
        work_dir: Option<PathBuf>,
        resume: bool,
        outbound: &mut O,
        inbound: &mut I,
    ) -> Flow
    where
        O: Sink<ChatEvent> + Unpin,
        I: Stream<Item = String> + Unpin,
    {
        if content.trim().is_empty() {
            return send(outbound, ChatEvent::error("Message is empty.")).await;
        }
        if let Some(dir) = &work_dir {
            if !dir.is_dir() {
                return send(
                    outbound,
                    ChatEvent::error(format!("Working directory does not exist: {}", dir.display())),
                )
                .await;
            }
        }

        // Per-actor state only changes once this message owns the slot.
        let lease = match self.guard.try_acquire(actor) {
            Ok(lease) => lease,
            Err(err) => {
                tracing::info!(actor = %actor, error = %err, "chat run rejected");
                return send(outbound, ChatEvent::error("A task is already running.")).await;
            }
        };
        if let Some(dir) = work_dir {
            self.guard.set_work_dir(actor, dir);
        }

        let mut request = ExecutionRequest::new(content)
            .working_dir(self.guard.work_dir_or(actor, &self.default_work_dir))
            .continue_session(resume && !self.guard.take_session_reset(actor));
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let mut stream = self.executor.execute_leased(lease, request);

        let mut response = ResponseBuilder::default();
        loop {
            tokio::select! {
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    response.push(&chunk);
                    let event = ChatEvent::Chunk {
                        content: chunk.content,
                        chunk_type: chunk.kind,
                    };
                    if outbound.send(event).await.is_err() {
                        return Flow::Disconnected;
                    }
                }
                next = inbound.next() => match next {
                    None => return Flow::Disconnected,
                    Some(raw) => match serde_json::from_str::<ChatRequest>(&raw) {
                        Ok(ChatRequest::Message { .. }) => {
                            if let Flow::Disconnected =
                                send(outbound, ChatEvent::error("A task is already running.")).await
                            {
                                return Flow::Disconnected;
                            }
                        }
                        Ok(control) => {
                            if let Flow::Disconnected = self.handle_control(actor, control, outbound).await {
                                return Flow::Disconnected;
                            }
                        }
                        Err(err) => tracing::debug!(error = %err, "ignoring malformed chat message during run"),
                    },
                },
            }
        }

        send(
            outbound,
            ChatEvent::Done {
                result: response.finish(),
            },
        )
        .await
    }
}

async fn send<O>(outbound: &mut O, event: ChatEvent) -> Flow
where
    O: Sink<ChatEvent> + Unpin,
{
    match outbound.send(event).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Disconnected,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use futures::channel::mpsc;
    use tempfile::TempDir;

    use crate::executor::ExecutorConfig;

    struct Harness {
        _dir: TempDir,
        guard: Arc<ConcurrencyGuard>,
        input: mpsc::UnboundedSender<String>,
        output: mpsc::UnboundedReceiver<ChatEvent>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start(agent_body: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let agent = dir.path().join("fake-agent");
            std::fs::write(&agent, format!("#!/bin/sh\n{agent_body}\n")).unwrap();
            std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

            let executor = AgentExecutor::new(ExecutorConfig {
                agent_binary: agent.to_string_lossy().into_owned(),
                run_as: None,
                kill_grace: Duration::from_millis(200),
                ..ExecutorConfig::default()
            });
            let guard = ConcurrencyGuard::new();
            let channel = ChatChannel::new(executor, guard.clone(), dir.path().to_path_buf(), None);
            let (input, in_rx) = mpsc::unbounded();
            let (out_tx, output) = mpsc::unbounded();
            let task = tokio::spawn(async move { channel.run("li", out_tx, in_rx).await });
            Self {
                _dir: dir,
                guard,
                input,
                output,
                task,
            }
        }

        fn send(&self, raw: &str) {
            self.input.unbounded_send(raw.to_string()).unwrap();
        }

        async fn next(&mut self) -> ChatEvent {
            tokio::time::timeout(Duration::from_secs(10), self.output.next())
                .await
                .expect("chat event")
                .expect("channel open")
        }

        async fn until_done(&mut self) -> Vec<ChatEvent> {
            let mut events = Vec::new();
            loop {
                let event = self.next().await;
                let done = matches!(event, ChatEvent::Done { .. });
                events.push(event);
                if done {
                    return events;
                }
            }
        }
    }

    #[tokio::test]
    async fn message_streams_chunks_then_done() {
        let mut chat = Harness::start(
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Looking."}]}}'
echo '{"type":"result","result":"All good."}'"#,
        );
        chat.send(r#"{"type":"message","content":"check it"}"#);
        let events = chat.until_done().await;
        assert_eq!(
            events,
            vec![
                ChatEvent::Chunk {
                    content: "Looking.".to_string(),
                    chunk_type: ChunkKind::Text
                },
                ChatEvent::Chunk {
                    content: "All good.".to_string(),
                    chunk_type: ChunkKind::Result
                },
                ChatEvent::Done {
                    result: "All good.".to_string()
                },
            ]
        );
        assert!(!chat.guard.is_active(&ActorKey::chat("li")));
    }

    #[tokio::test]
    async fn second_message_while_busy_is_rejected() {
        let mut chat = Harness::start("sleep 1\necho '{\"type\":\"result\",\"result\":\"done\"}'");
        chat.send(r#"{"type":"message","content":"one"}"#);
        chat.send(r#"{"type":"message","content":"two"}"#);

        assert_eq!(chat.next().await, ChatEvent::error("A task is already running."));
        let events = chat.until_done().await;
        assert_eq!(events.last(), Some(&ChatEvent::Done { result: "done".to_string() }));
    }

    #[tokio::test]
    async fn cancel_stops_the_run() {
        let mut chat = Harness::start("echo started\nexec sleep 30");
        chat.send(r#"{"type":"message","content":"long job"}"#);
        assert_eq!(
            chat.next().await,
            ChatEvent::Chunk {
                content: "started".to_string(),
                chunk_type: ChunkKind::Text
            }
        );
        chat.send(r#"{"type":"cancel"}"#);
        let events = chat.until_done().await;
        assert!(events.contains(&ChatEvent::Chunk {
            content: "Cancelled.".to_string(),
            chunk_type: ChunkKind::Error
        }));
    }

    #[tokio::test]
    async fn rejects_empty_and_malformed_messages() {
        let mut chat = Harness::start("exit 0");
        chat.send(r#"{"type":"message","content":"   "}"#);
        assert_eq!(chat.next().await, ChatEvent::error("Message is empty."));
        chat.send("{oops");
        assert!(matches!(chat.next().await, ChatEvent::Error { message } if message.starts_with("invalid message")));
        chat.send(r#"{"type":"cancel"}"#);
        assert_eq!(chat.next().await, ChatEvent::error("No task is running."));
    }

    #[tokio::test]
    async fn reset_disables_continue_once() {
        let mut chat = Harness::start(r#"echo "$@""#);
        chat.send(r#"{"type":"reset"}"#);
        chat.send(r#"{"type":"message","content":"a","continue":true}"#);
        let first = chat.until_done().await;
        assert!(matches!(&first[0], ChatEvent::Chunk { content, .. } if !content.contains("--continue")));

        chat.send(r#"{"type":"message","content":"b","continue":true}"#);
        let second = chat.until_done().await;
        assert!(matches!(&second[0], ChatEvent::Chunk { content, .. } if content.ends_with("--continue")));
    }

    #[tokio::test]
    async fn rejected_message_leaves_reset_and_work_dir_untouched() {
        let mut chat = Harness::start(r#"echo "$@""#);
        let actor = ActorKey::chat("li");
        let elsewhere = TempDir::new().unwrap();
        let busy = chat.guard.try_acquire(&actor).unwrap();

        chat.send(r#"{"type":"reset"}"#);
        let rejected = serde_json::json!({
            "type": "message",
            "content": "a",
            "continue": true,
            "work_dir": elsewhere.path(),
        });
        chat.send(&rejected.to_string());
        assert_eq!(chat.next().await, ChatEvent::error("A task is already running."));
        assert_eq!(chat.guard.work_dir(&actor), None);
        drop(busy);

        chat.send(r#"{"type":"message","content":"a","continue":true}"#);
        let events = chat.until_done().await;
        assert!(matches!(&events[0], ChatEvent::Chunk { content, .. } if !content.contains("--continue")));
    }

    #[tokio::test]
    async fn disconnect_ends_session() {
        let chat = Harness::start("exec sleep 30");
        chat.send(r#"{"type":"message","content":"long job"}"#);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Harness { input, task, guard, .. } = chat;
        drop(input);
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        let actor = ActorKey::chat("li");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while guard.is_active(&actor) {
            assert!(std::time::Instant::now() < deadline, "slot never released");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn events_serialize_like_the_dashboard_expects() {
        let json = serde_json::to_value(ChatEvent::Chunk {
            content: "[Bash] ls".to_string(),
            chunk_type: ChunkKind::ToolUse,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "chunk", "content": "[Bash] ls", "chunk_type": "tool_use"})
        );
    }
}
