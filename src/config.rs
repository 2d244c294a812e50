//! Atelier configuration for the supervisor and the orchestrator.
//!
//! Values are plain structs with defaults; an outer loader deserializes them.
//! Every constructor that takes a config calls `validate()` first.

use crate::{AtelierError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory for per-session log files (`~/.atelier/logs` when unset)
    pub log_dir: Option<PathBuf>,
    /// Bytes of recent output retained per session for capture
    pub buffer_capacity: usize,
    /// Inactivity after which a running session is reclassified as idle
    pub idle_timeout_ms: u64,
    /// Resource sampling interval
    pub resource_interval_ms: u64,
    pub memory_alert_bytes: u64,
    pub cpu_alert_percent: f64,
    /// Upper bound for a single write/kill on a backing session
    pub io_timeout_ms: u64,
    /// Line sent to an agent to ask it to exit on its own
    pub shutdown_command: String,
    /// How long a graceful stop waits before forcing
    pub shutdown_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            buffer_capacity: 1024 * 1024,
            idle_timeout_ms: 5 * 60 * 1000,
            resource_interval_ms: 30_000,
            memory_alert_bytes: 1024 * 1024 * 1024,
            cpu_alert_percent: 80.0,
            io_timeout_ms: 5_000,
            shutdown_command: "exit".to_string(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(AtelierError::invalid_config(
                "buffer_capacity",
                "must be greater than zero",
            ));
        }
        if self.idle_timeout_ms < 2 {
            return Err(AtelierError::invalid_config(
                "idle_timeout_ms",
                "must be at least 2ms",
            ));
        }
        if self.resource_interval_ms == 0 {
            return Err(AtelierError::invalid_config(
                "resource_interval_ms",
                "must be greater than zero",
            ));
        }
        if !(0.0..=100.0 * 1024.0).contains(&self.cpu_alert_percent) {
            return Err(AtelierError::invalid_config(
                "cpu_alert_percent",
                "must be a non-negative percentage",
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(AtelierError::invalid_config(
                "io_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Idle checks run at half the timeout so detection lands within one window.
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms / 2)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_millis(self.resource_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Agent selection among eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    RoundRobin,
    LeastBusy,
}

/// Delay growth between delegation retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Hard bounds a single decision must respect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    /// Minimum confidence (0-1) to delegate without a human
    pub min_confidence: f64,
    pub max_tokens_per_decision: usize,
    pub max_processing_ms: u64,
    /// Successful tasks slower than this count against the error window
    pub max_agent_response_ms: u64,
    /// Error rate over the rolling window above which delegation stops
    pub max_error_rate: f64,
    /// Number of recent delegation outcomes in the rolling window
    pub error_window: usize,
    /// Outcomes older than this fall out of the window
    pub error_window_ms: u64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            max_tokens_per_decision: 10_000,
            max_processing_ms: 30_000,
            max_agent_response_ms: 10 * 60 * 1000,
            max_error_rate: 0.25,
            error_window: 20,
            error_window_ms: 10 * 60 * 1000,
        }
    }
}

/// How the orchestrator spreads work over agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub max_active_agents: usize,
    pub load_balancing: LoadBalancing,
    /// Extra attempts on a different agent after a failed delegation
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff: Backoff,
    /// How long to wait for an agent's task result
    pub default_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_active_agents: 5,
            load_balancing: LoadBalancing::RoundRobin,
            retry_attempts: 2,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            backoff: Backoff::Exponential,
            default_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl DecisionThresholds {
    pub fn max_processing(&self) -> Duration {
        Duration::from_millis(self.max_processing_ms)
    }

    pub fn max_agent_response(&self) -> Duration {
        Duration::from_millis(self.max_agent_response_ms)
    }

    pub fn error_window_age(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }
}

impl CoordinationConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Orchestrator decision core settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on reasoning steps per decision
    pub max_chain_of_thought_depth: usize,
    /// Decision cycles allowed in flight at once
    pub max_concurrent_decisions: usize,
    /// Context budget in estimated tokens
    pub max_context_size: usize,
    /// Fraction of `max_context_size` compression aims for
    pub context_target_ratio: f64,
    /// Recent signals kept as decision context
    pub signal_history: usize,
    pub thresholds: DecisionThresholds,
    pub coordination: CoordinationConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_chain_of_thought_depth: 8,
            max_concurrent_decisions: 3,
            max_context_size: 8_000,
            context_target_ratio: 0.8,
            signal_history: 50,
            thresholds: DecisionThresholds::default(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chain_of_thought_depth == 0 {
            return Err(AtelierError::invalid_config(
                "max_chain_of_thought_depth",
                "must be greater than zero",
            ));
        }
        if self.max_concurrent_decisions == 0 {
            return Err(AtelierError::invalid_config(
                "max_concurrent_decisions",
                "must be greater than zero",
            ));
        }
        if self.max_context_size == 0 {
            return Err(AtelierError::invalid_config(
                "max_context_size",
                "must be greater than zero",
            ));
        }
        if !(self.context_target_ratio > 0.0 && self.context_target_ratio <= 1.0) {
            return Err(AtelierError::invalid_config(
                "context_target_ratio",
                "must be in (0, 1]",
            ));
        }
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.min_confidence) {
            return Err(AtelierError::invalid_config(
                "thresholds.min_confidence",
                "must be in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&t.max_error_rate) {
            return Err(AtelierError::invalid_config(
                "thresholds.max_error_rate",
                "must be in [0, 1]",
            ));
        }
        if t.error_window == 0 || t.error_window_ms == 0 {
            return Err(AtelierError::invalid_config(
                "thresholds.error_window",
                "window size and age must be greater than zero",
            ));
        }
        let c = &self.coordination;
        if c.max_active_agents == 0 {
            return Err(AtelierError::invalid_config(
                "coordination.max_active_agents",
                "must be greater than zero",
            ));
        }
        if c.default_timeout_ms == 0 {
            return Err(AtelierError::invalid_config(
                "coordination.default_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SupervisorConfig::default().validate().is_ok());
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn idle_checks_run_at_half_the_timeout() {
        let config = SupervisorConfig {
            idle_timeout_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.idle_check_interval(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut config = OrchestratorConfig::default();
        config.thresholds.min_confidence = 1.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"max_concurrent_decisions": 1, "coordination": {"load_balancing": "least_busy"}}"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_decisions, 1);
        assert_eq!(config.coordination.load_balancing, LoadBalancing::LeastBusy);
        assert_eq!(config.coordination.retry_attempts, 2);
    }
}
