//! Atelier: supervision and orchestration core for coding agents
//!
//! A small fleet of long-running agents (developer, QA, analyst, ...) each runs
//! in its own terminal session. The supervisor keeps those sessions alive and
//! watched, the lifecycle manager owns who is running, and the orchestrator
//! decides who gets which piece of work.

pub mod accounting;
pub mod agent;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod supervisor;
pub mod telemetry;
pub mod testing;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Agent not registered: {0}")]
    NotRegistered(String),

    #[error("Agent {agent_id} is already {state}")]
    AlreadyRunning { agent_id: String, state: String },

    #[error("Agent {agent_id} is not running (state: {state})")]
    NotRunning { agent_id: String, state: String },

    #[error("Agent {agent_id} must be stopped first (state: {state})")]
    StillRunning { agent_id: String, state: String },

    #[error("Agent is disabled: {0}")]
    AgentDisabled(String),

    #[error("Agent {agent_id} failed and must be stopped before respawning: {reason}")]
    AgentFailed { agent_id: String, reason: String },

    #[error("Task {task_id} on agent {agent_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        agent_id: String,
        task_id: String,
        timeout_ms: u64,
    },

    #[error("Task {task_id} on agent {agent_id} failed: {message}")]
    TaskFailed {
        agent_id: String,
        task_id: String,
        message: String,
    },

    #[error("Token limit exceeded for {agent_id}: {message}")]
    TokenLimit { agent_id: String, message: String },

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid configuration: {field}: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Accounting error: {0}")]
    Accounting(String),

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AtelierError {
    pub(crate) fn invalid_config(field: &str, message: impl Into<String>) -> Self {
        AtelierError::InvalidConfig {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Stable kind name for UI layers.
    pub fn kind(&self) -> &'static str {
        match self {
            AtelierError::DuplicateAgent(_) => "duplicate_agent",
            AtelierError::NotRegistered(_) => "not_registered",
            AtelierError::AlreadyRunning { .. } => "already_running",
            AtelierError::NotRunning { .. } => "not_running",
            AtelierError::StillRunning { .. } => "still_running",
            AtelierError::AgentDisabled(_) => "agent_disabled",
            AtelierError::AgentFailed { .. } => "agent_failed",
            AtelierError::TaskTimeout { .. } => "task_timeout",
            AtelierError::TaskFailed { .. } => "task_failed",
            AtelierError::TokenLimit { .. } => "token_limit",
            AtelierError::SessionCreation(_) => "session_creation",
            AtelierError::SessionNotFound(_) => "session_not_found",
            AtelierError::Session(_) => "session",
            AtelierError::InvalidConfig { .. } => "invalid_config",
            AtelierError::Pty(_) => "pty",
            AtelierError::Accounting(_) => "accounting",
            AtelierError::Orchestrator(_) => "orchestrator",
            AtelierError::Io(_) => "io",
            AtelierError::Serialization(_) => "serialization",
        }
    }

    /// Configuration errors are rejected synchronously and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AtelierError::DuplicateAgent(_)
                | AtelierError::NotRegistered(_)
                | AtelierError::AlreadyRunning { .. }
                | AtelierError::StillRunning { .. }
                | AtelierError::AgentDisabled(_)
                | AtelierError::AgentFailed { .. }
                | AtelierError::InvalidConfig { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AtelierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(AtelierError::DuplicateAgent("dev-1".into()).is_configuration());
        assert!(
            !AtelierError::TaskTimeout {
                agent_id: "dev-1".into(),
                task_id: "t".into(),
                timeout_ms: 1,
            }
            .is_configuration()
        );
        assert_eq!(
            AtelierError::SessionNotFound("ses-1".into()).kind(),
            "session_not_found"
        );
    }
}
