//! Execution of a single scheduled prompt.
//!
//! When a task fires is decided by the caller; this module only runs it
//! under the task's guard slot and reduces the output to one result text.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_dash_error::SandboxError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::executor::{AgentExecutor, ExecutionRequest, ResponseBuilder};
use crate::guard::{ActorKey, ConcurrencyGuard};

pub const DEFAULT_SCHEDULED_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledTask {
    pub prompt: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledRun {
    pub task_id: String,
    /// RFC 3339 start time.
    pub ran_at: String,
    pub result: String,
    pub ok: bool,
}

/// Run `task` once as `scheduled:<task_id>`.
///
/// Fails with [`SandboxError::ExecutionInProgress`] while a previous firing
/// of the same task is still running.
pub async fn run_scheduled(
    executor: &AgentExecutor,
    guard: &Arc<ConcurrencyGuard>,
    task_id: &str,
    task: ScheduledTask,
    timeout: Duration,
) -> Result<ScheduledRun, SandboxError> {
    if task.prompt.trim().is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "scheduled prompt is empty".to_string(),
        });
    }
    let actor = ActorKey::scheduled(task_id);
    let ran_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    let mut request = ExecutionRequest::new(task.prompt).timeout(timeout);
    if let Some(dir) = task.work_dir.or_else(|| guard.work_dir(&actor)) {
        request = request.working_dir(dir);
    }

    let mut stream = executor.execute_as(guard, &actor, request)?;
    tracing::info!(task_id, timeout_secs = timeout.as_secs(), "scheduled run started");

    let mut response = ResponseBuilder::default();
    while let Some(chunk) = stream.next().await {
        response.push(&chunk);
    }
    let ok = !response.saw_error();
    let result = response.finish();
    tracing::info!(task_id, ok, "scheduled run finished");

    Ok(ScheduledRun {
        task_id: task_id.to_string(),
        ran_at,
        result,
        ok,
    })
}
