//! Session backend abstraction
//!
//! A backend turns a launch request into a running, isolated execution
//! context with an input stream and buffered output. The supervisor never
//! touches a PTY or process directly; it only goes through these traits.

use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::buffer::RingBuffer;
use super::logger::SessionLogger;

/// Unique session identifier
pub type SessionId = String;

/// Generate a unique session ID
pub fn generate_session_id() -> SessionId {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: String = (0..4)
        .map(|_| format!("{:x}", rand::random::<u8>() % 16))
        .collect();
    format!("ses-{:x}-{}", timestamp, suffix)
}

/// Environment variables every agent process receives
pub const ENV_AGENT_ID: &str = "ATELIER_AGENT_ID";
pub const ENV_SESSION_ID: &str = "ATELIER_SESSION_ID";
pub const ENV_LOG_PATH: &str = "ATELIER_LOG_PATH";
pub const ENV_WORKDIR: &str = "ATELIER_WORKDIR";

/// What to run for an agent
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment on top of the atelier variables
    pub env: HashMap<String, String>,
}

/// Everything a backend needs to start one session
pub struct LaunchSpec {
    pub session_id: SessionId,
    pub agent_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub buffer_capacity: usize,
    /// Receives every byte of output
    pub logger: SessionLogger,
}

impl LaunchSpec {
    pub fn new(
        session_id: SessionId,
        agent_id: &str,
        config: &LaunchConfig,
        working_dir: PathBuf,
        buffer_capacity: usize,
        logger: SessionLogger,
    ) -> Self {
        let mut env = config.env.clone();
        env.insert(ENV_AGENT_ID.to_string(), agent_id.to_string());
        env.insert(ENV_SESSION_ID.to_string(), session_id.clone());
        env.insert(
            ENV_LOG_PATH.to_string(),
            logger.path().display().to_string(),
        );
        env.insert(
            ENV_WORKDIR.to_string(),
            working_dir.display().to_string(),
        );
        Self {
            session_id,
            agent_id: agent_id.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            env,
            working_dir,
            buffer_capacity,
            logger,
        }
    }
}

/// Status of the backing process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process is running
    Running,
    /// Process exited with code
    Exited(i32),
    /// Process failed to start or crashed
    Failed(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        *self == ProcessStatus::Running
    }
}

/// A live execution context created by a [`SessionBackend`]
pub trait SessionHandle: Send {
    /// OS process id, when the backend has one
    fn pid(&self) -> Option<u32>;

    /// Write to the session's input stream
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Shared buffer the backend appends output to
    fn output_buffer(&self) -> Arc<Mutex<RingBuffer>>;

    /// Poll the backing process and return its current status
    fn poll(&mut self) -> ProcessStatus;

    /// Kill the backing process
    fn kill(&mut self) -> Result<()>;
}

/// Creates execution contexts
pub trait SessionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the process. Errors are `SessionCreation` and are not retried.
    fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn SessionHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(a.starts_with("ses-"));
        assert_ne!(a, b);
    }

    #[test]
    fn launch_spec_carries_agent_environment() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::create(dir.path(), "ses-env").unwrap();
        let config = LaunchConfig {
            command: "claude".into(),
            args: vec![],
            env: HashMap::from([("EXTRA".to_string(), "1".to_string())]),
        };
        let spec = LaunchSpec::new(
            "ses-env".into(),
            "dev-1",
            &config,
            dir.path().to_path_buf(),
            64,
            logger,
        );
        assert_eq!(spec.env[ENV_AGENT_ID], "dev-1");
        assert_eq!(spec.env[ENV_SESSION_ID], "ses-env");
        assert!(spec.env[ENV_LOG_PATH].ends_with("ses-env.log"));
        assert_eq!(spec.env["EXTRA"], "1");
    }
}
