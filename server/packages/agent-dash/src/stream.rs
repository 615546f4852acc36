//! Classification of the agent CLI's `stream-json` output.
//!
//! The agent emits one JSON event per line. Each line is turned into zero
//! or more [`Chunk`]s tagged with a [`ChunkKind`] so callers can render tool
//! activity differently from prose and pick out the final answer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum characters of tool stdout (and other tool results) forwarded.
const TOOL_RESULT_LIMIT: usize = 500;
/// Maximum characters of tool stderr forwarded.
const TOOL_STDERR_LIMIT: usize = 300;

/// Input fields tried, in order, to describe a tool invocation.
const TOOL_DESCRIPTION_FIELDS: [&str; 6] = [
    "description",
    "command",
    "pattern",
    "query",
    "file_path",
    "prompt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    ToolUse,
    ToolResult,
    Error,
    /// The authoritative final answer of a run.
    Result,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Text => "text",
            ChunkKind::ToolUse => "tool_use",
            ChunkKind::ToolResult => "tool_result",
            ChunkKind::Error => "error",
            ChunkKind::Result => "result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn new(content: impl Into<String>, kind: ChunkKind) -> Self {
        Self {
            content: content.into(),
            kind,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(content, ChunkKind::Text)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(content, ChunkKind::Error)
    }
}

/// Classify a single line of agent output.
///
/// Lines that are not JSON objects are passed through as text unless blank.
pub fn classify_line(line: &str) -> Vec<Chunk> {
    let event = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(event)) => event,
        Ok(_) | Err(_) => {
            return if line.trim().is_empty() {
                Vec::new()
            } else {
                vec![Chunk::text(line)]
            };
        }
    };

    match event.get("type").and_then(Value::as_str).unwrap_or_default() {
        "assistant" => classify_assistant(&event),
        "user" => classify_tool_result(&event),
        "result" => match non_empty_str(event.get("result")) {
            Some(result) => vec![Chunk::new(result, ChunkKind::Result)],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn classify_assistant(event: &Map<String, Value>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for block in content_blocks(event) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = non_empty_str(block.get("text")) {
                    chunks.push(Chunk::text(text));
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let description = block
                    .get("input")
                    .and_then(Value::as_object)
                    .and_then(tool_description);
                // Emitted even without a description; consumers count on one
                // chunk per tool_use block.
                let content = match description {
                    Some(desc) => format!("[{name}] {desc}"),
                    None => format!("[{name}]"),
                };
                chunks.push(Chunk::new(content, ChunkKind::ToolUse));
            }
            _ => {}
        }
    }
    chunks
}

fn tool_description(input: &Map<String, Value>) -> Option<&str> {
    TOOL_DESCRIPTION_FIELDS
        .iter()
        .find_map(|field| non_empty_str(input.get(*field)))
}

fn classify_tool_result(event: &Map<String, Value>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    match event.get("tool_use_result") {
        Some(Value::Object(result)) => {
            if let Some(stdout) = non_empty_str(result.get("stdout")) {
                chunks.push(Chunk::new(
                    truncate(stdout, TOOL_RESULT_LIMIT),
                    ChunkKind::ToolResult,
                ));
            }
            if let Some(stderr) = non_empty_str(result.get("stderr")) {
                chunks.push(Chunk::error(truncate(stderr, TOOL_STDERR_LIMIT)));
            }
        }
        Some(Value::String(result)) if !result.is_empty() => {
            chunks.push(Chunk::new(
                truncate(result, TOOL_RESULT_LIMIT),
                ChunkKind::ToolResult,
            ));
        }
        _ => {
            for block in content_blocks(event) {
                if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                    continue;
                }
                match block.get("content") {
                    Some(Value::String(content)) if !content.is_empty() => {
                        chunks.push(Chunk::new(
                            truncate(content, TOOL_RESULT_LIMIT),
                            ChunkKind::ToolResult,
                        ));
                    }
                    Some(Value::Array(items)) => {
                        for item in items.iter().filter_map(Value::as_object) {
                            if item.get("type").and_then(Value::as_str) != Some("text") {
                                continue;
                            }
                            if let Some(text) = non_empty_str(item.get("text")) {
                                chunks.push(Chunk::new(
                                    truncate(text, TOOL_RESULT_LIMIT),
                                    ChunkKind::ToolResult,
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    chunks
}

/// Object blocks of `message.content`, skipping anything malformed.
fn content_blocks(event: &Map<String, Value>) -> impl Iterator<Item = &Map<String, Value>> {
    event
        .get("message")
        .and_then(Value::as_object)
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Keep the first `limit` characters, appending `...` when anything was cut.
fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and classify every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Chunk> {
        self.pending.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if line.trim().is_empty() {
                continue;
            }
            chunks.extend(classify_line(&line));
        }
        chunks
    }

    /// Classify whatever partial line is left once the source has ended.
    pub fn finish(&mut self) -> Vec<Chunk> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest);
        if line.trim().is_empty() {
            return Vec::new();
        }
        classify_line(&line)
    }
}
