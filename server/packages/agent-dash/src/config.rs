//! Runtime settings shared by every endpoint.

use std::path::PathBuf;
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::privilege::RunAsUser;
use crate::pty::PtyBackend;
use crate::scheduler::DEFAULT_SCHEDULED_TIMEOUT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identity attached to authenticated connections.
    pub username: String,
    pub agent_binary: String,
    /// User agent processes are demoted to when running as root. `None`
    /// disables demotion.
    pub run_as: Option<String>,
    /// Fallback program for the interactive terminal.
    pub shell: String,
    pub pty_backend: PtyBackend,
    /// Working directory for agent runs that do not pick one.
    pub work_dir: PathBuf,
    /// Starting directory of command terminal sessions.
    pub terminal_home: PathBuf,
    pub chat_timeout: Option<Duration>,
    pub scheduled_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self {
            username: "admin".to_string(),
            agent_binary: "claude".to_string(),
            run_as: Some("claude".to_string()),
            shell: "/bin/bash".to_string(),
            pty_backend: PtyBackend::default(),
            work_dir: default_work_dir(&home),
            terminal_home: home,
            chat_timeout: None,
            scheduled_timeout: DEFAULT_SCHEDULED_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            agent_binary: self.agent_binary.clone(),
            run_as: self.run_as.clone(),
            ..ExecutorConfig::default()
        }
    }

    pub fn run_as_user(&self) -> Option<RunAsUser> {
        RunAsUser::resolve(self.run_as.as_deref())
    }
}

/// `~/projects` when it exists, otherwise the home directory itself.
pub fn default_work_dir(home: &std::path::Path) -> PathBuf {
    let projects = home.join("projects");
    if projects.is_dir() {
        projects
    } else {
        home.to_path_buf()
    }
}
