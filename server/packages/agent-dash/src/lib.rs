//! Agent dashboard core: drives a coding-agent CLI and a shell over
//! WebSockets.

pub mod chat;
pub mod cli;
pub mod config;
pub mod executor;
pub mod guard;
pub mod privilege;
#[cfg(unix)]
mod process;
pub mod pty;
pub mod router;
pub mod scheduler;
pub mod stream;
pub mod telemetry;
pub mod terminal;
