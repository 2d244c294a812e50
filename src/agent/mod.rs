//! Agent registry and lifecycle
//!
//! Handles registration, state tracking, spawning, task execution and
//! health checking of the agent fleet.

mod lifecycle;
pub mod protocol;
mod registry;
mod task;

pub use lifecycle::AgentLifecycleManager;
pub use registry::{AgentPhase, AgentRegistry};
pub use task::{Task, TaskOptions, TaskResult};

use crate::supervisor::LaunchConfig;
use crate::{AtelierError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Agent roles
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentType {
    Developer,
    Qa,
    Analyst,
    Architect,
    Reviewer,
    Devops,
    Custom(String),
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Developer => write!(f, "developer"),
            AgentType::Qa => write!(f, "qa"),
            AgentType::Analyst => write!(f, "analyst"),
            AgentType::Architect => write!(f, "architect"),
            AgentType::Reviewer => write!(f, "reviewer"),
            AgentType::Devops => write!(f, "devops"),
            AgentType::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl AgentType {
    /// Parse a role name
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "developer" | "dev" => AgentType::Developer,
            "qa" | "tester" => AgentType::Qa,
            "analyst" => AgentType::Analyst,
            "architect" => AgentType::Architect,
            "reviewer" => AgentType::Reviewer,
            "devops" | "ops" => AgentType::Devops,
            _ => AgentType::Custom(s.to_string()),
        }
    }
}

impl From<String> for AgentType {
    fn from(s: String) -> Self {
        AgentType::from_str(&s)
    }
}

impl From<AgentType> for String {
    fn from(t: AgentType) -> Self {
        t.to_string()
    }
}

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Spawning,
    Running,
    Idle,
    Stopping,
    Error,
}

impl AgentState {
    /// Eligible to take work
    pub fn is_available(&self) -> bool {
        matches!(self, AgentState::Running | AgentState::Idle)
    }

    /// A session exists in these states
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            AgentState::Spawning | AgentState::Running | AgentState::Idle | AgentState::Stopping
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Stopped => write!(f, "stopped"),
            AgentState::Spawning => write!(f, "spawning"),
            AgentState::Running => write!(f, "running"),
            AgentState::Idle => write!(f, "idle"),
            AgentState::Stopping => write!(f, "stopping"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    /// Default task timeout when the caller gives none
    pub max_execution_ms: u64,
    pub needs_network: bool,
    pub needs_filesystem: bool,
    pub parallelizable: bool,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_cores: 1.0,
            max_execution_ms: 5 * 60 * 1000,
            needs_network: true,
            needs_filesystem: true,
            parallelizable: false,
        }
    }
}

impl ResourceRequirements {
    pub fn max_execution(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckPolicy {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Bound on a single probe
    pub timeout_ms: u64,
    /// Consecutive failed probes before the agent is marked as errored
    pub max_failures: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            max_failures: 3,
        }
    }
}

impl HealthCheckPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLimits {
    pub daily_limit: Option<u64>,
    pub per_request_limit: Option<u64>,
    pub cost_ceiling: Option<f64>,
    /// Fraction of the daily limit that raises a warning alert
    pub warning_threshold: f64,
    /// Fraction of the daily limit that raises a critical alert
    pub critical_threshold: f64,
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            daily_limit: None,
            per_request_limit: None,
            cost_ceiling: None,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
        }
    }
}

/// Static definition of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub agent_type: AgentType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher wins when several agents could take the same work
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub health_check: HealthCheckPolicy,
    #[serde(default)]
    pub token_limits: TokenLimits,
    /// Program to run in the session
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Sent as the first message of every new session
    #[serde(default)]
    pub instructions: Option<String>,
    /// Defaults to the current directory
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Model name passed to token accounting
    #[serde(default)]
    pub model: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_command() -> String {
    "claude".to_string()
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            agent_type,
            enabled: true,
            priority: 0,
            resources: ResourceRequirements::default(),
            health_check: HealthCheckPolicy::default(),
            token_limits: TokenLimits::default(),
            command: default_command(),
            args: Vec::new(),
            instructions: None,
            working_directory: None,
            env: HashMap::new(),
            model: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(AtelierError::invalid_config(
                "id",
                "must be non-empty and contain no whitespace",
            ));
        }
        if self.command.trim().is_empty() {
            return Err(AtelierError::invalid_config("command", "must not be empty"));
        }
        if self.resources.max_execution_ms == 0 {
            return Err(AtelierError::invalid_config(
                "resources.max_execution_ms",
                "must be greater than zero",
            ));
        }
        let hc = &self.health_check;
        if hc.enabled && (hc.interval_ms == 0 || hc.timeout_ms == 0 || hc.max_failures == 0) {
            return Err(AtelierError::invalid_config(
                "health_check",
                "interval, timeout and max_failures must be greater than zero",
            ));
        }
        let tl = &self.token_limits;
        if !(0.0 < tl.warning_threshold
            && tl.warning_threshold <= tl.critical_threshold
            && tl.critical_threshold <= 1.0)
        {
            return Err(AtelierError::invalid_config(
                "token_limits",
                "thresholds must satisfy 0 < warning <= critical <= 1",
            ));
        }
        if tl.cost_ceiling.is_some_and(|c| c < 0.0) {
            return Err(AtelierError::invalid_config(
                "token_limits.cost_ceiling",
                "must not be negative",
            ));
        }
        Ok(())
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("default")
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub id: String,
    pub agent_type: AgentType,
    pub enabled: bool,
    pub priority: i32,
    /// Registration order, lower registered earlier
    pub registration: u64,
    pub state: AgentState,
    /// Present only while running, idle or stopping
    pub start_time: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub error_count: u64,
    pub uptime: Duration,
    pub session_id: Option<String>,
    pub active_tasks: usize,
    pub tokens_today: u64,
    pub total_cost: f64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_type_round_trips_through_strings() {
        assert_eq!(AgentType::from_str("QA"), AgentType::Qa);
        assert_eq!(AgentType::from_str("dev"), AgentType::Developer);
        assert_eq!(
            AgentType::from_str("translator"),
            AgentType::Custom("translator".into())
        );
        let json = serde_json::to_string(&AgentType::Reviewer).unwrap();
        assert_eq!(json, "\"reviewer\"");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"id": "qa-1", "agent_type": "qa", "priority": 3}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.priority, 3);
        assert_eq!(config.command, "claude");
        assert!(config.health_check.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_thresholds() {
        let mut config = AgentConfig::new("dev-1", AgentType::Developer);
        config.token_limits.warning_threshold = 0.99;
        config.token_limits.critical_threshold = 0.5;
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_config");

        let config = AgentConfig::new("has space", AgentType::Developer);
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_states() {
        assert!(AgentState::Idle.is_available());
        assert!(!AgentState::Spawning.is_available());
        assert!(AgentState::Stopping.has_session());
        assert!(!AgentState::Error.has_session());
    }
}
