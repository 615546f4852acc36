//! Error types shared by the agent-dash crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    ExecutionInProgress,
    SpawnFailed,
    NotFound,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-dash:error:invalid_request",
            Self::TokenInvalid => "urn:agent-dash:error:token_invalid",
            Self::ExecutionInProgress => "urn:agent-dash:error:execution_in_progress",
            Self::SpawnFailed => "urn:agent-dash:error:spawn_failed",
            Self::NotFound => "urn:agent-dash:error:not_found",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::ExecutionInProgress => "Execution In Progress",
            Self::SpawnFailed => "Process Spawn Failed",
            Self::NotFound => "Not Found",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::ExecutionInProgress => 409,
            Self::SpawnFailed => 500,
            Self::NotFound => 404,
        }
    }
}

/// RFC 7807 problem details body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum SandboxError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("an execution is already running for {actor}")]
    ExecutionInProgress { actor: String },
    #[error("failed to start {program}: {message}")]
    SpawnFailed { program: String, message: String },
    #[error("not found: {resource}")]
    NotFound { resource: String },
}

impl SandboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::ExecutionInProgress { .. } => ErrorType::ExecutionInProgress,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::NotFound { .. } => ErrorType::NotFound,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        match self {
            Self::ExecutionInProgress { actor } => {
                problem
                    .extensions
                    .insert("actor".to_string(), Value::String(actor.clone()));
            }
            Self::SpawnFailed { program, .. } => {
                problem
                    .extensions
                    .insert("program".to_string(), Value::String(program.clone()));
            }
            Self::TokenInvalid {
                message: Some(message),
            } => {
                problem
                    .extensions
                    .insert("reason".to_string(), Value::String(message.clone()));
            }
            _ => {}
        }
        problem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_status_and_extensions() {
        let err = SandboxError::ExecutionInProgress {
            actor: "chat:li".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 409);
        assert_eq!(
            problem.extensions.get("actor").and_then(Value::as_str),
            Some("chat:li")
        );

        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "urn:agent-dash:error:execution_in_progress");
        assert_eq!(json["actor"], "chat:li");
    }

    #[test]
    fn token_invalid_maps_to_unauthorized() {
        let err = SandboxError::TokenInvalid { message: None };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 401);
        assert!(problem.extensions.is_empty());
    }
}
