//! Supervised session state
//!
//! One [`ManagedSession`] per spawned agent: the backing handle plus the
//! message history and the token/performance/resource accumulators.
//! Counters only grow for the life of a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backend::{SessionHandle, SessionId};
use super::buffer::RingBuffer;
use super::inspector::ResourceSample;

/// Supervisor-side state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Idle,
    Stopped,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Running => write!(f, "running"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Caller asked for it
    Requested,
    /// The agent exited after a shutdown instruction
    Graceful,
    /// Health checks gave up on it
    HealthCheckFailed,
    /// The process disappeared on its own
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Requested => "requested",
            TerminationReason::Graceful => "graceful",
            TerminationReason::HealthCheckFailed => "health_check_failed",
            TerminationReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    ToAgent,
    FromAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Instruction,
    Status,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// One entry in a session's history. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub direction: MessageDirection,
    pub message_type: MessageType,
    pub content: String,
    pub priority: MessagePriority,
    pub attempts: u32,
}

impl Message {
    pub fn to_agent(content: &str, message_type: MessageType, priority: MessagePriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            direction: MessageDirection::ToAgent,
            message_type,
            content: content.to_string(),
            priority,
            attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Performance {
    pub tasks_completed: u64,
    pub average_task_ms: f64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub peak_memory_bytes: u64,
    pub peak_cpu_percent: f64,
    pub average_memory_bytes: f64,
    pub average_cpu_percent: f64,
    pub samples: u64,
}

impl ResourceStats {
    pub fn record(&mut self, sample: ResourceSample) {
        self.samples += 1;
        let n = self.samples as f64;
        self.peak_memory_bytes = self.peak_memory_bytes.max(sample.memory_bytes);
        self.peak_cpu_percent = self.peak_cpu_percent.max(sample.cpu_percent);
        self.average_memory_bytes += (sample.memory_bytes as f64 - self.average_memory_bytes) / n;
        self.average_cpu_percent += (sample.cpu_percent - self.average_cpu_percent) / n;
    }
}

/// Mutable part of a session, guarded by one lock
#[derive(Debug)]
pub(crate) struct SessionRecord {
    pub state: SessionState,
    pub last_activity: Instant,
    pub last_activity_at: DateTime<Utc>,
    /// Output offset the idle monitor last saw
    pub seen_output: usize,
    pub history: Vec<Message>,
    pub interactions: u64,
    pub tokens: TokenUsage,
    pub performance: Performance,
    pub resources: ResourceStats,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            state: SessionState::Running,
            last_activity: Instant::now(),
            last_activity_at: Utc::now(),
            seen_output: 0,
            history: Vec::new(),
            interactions: 0,
            tokens: TokenUsage::default(),
            performance: Performance::default(),
            resources: ResourceStats::default(),
            ended_at: None,
        }
    }

    /// Reset the activity clock. Returns true when this woke an idle session.
    pub fn touch(&mut self) -> bool {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
        if self.state == SessionState::Idle {
            self.state = SessionState::Running;
            return true;
        }
        false
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// A session owned by the supervisor
pub(crate) struct ManagedSession {
    pub id: SessionId,
    pub agent_id: String,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub output: Arc<Mutex<RingBuffer>>,
    pub handle: Mutex<Box<dyn SessionHandle>>,
    pub record: Mutex<SessionRecord>,
    /// Keeps history order equal to write order
    pub send_lock: tokio::sync::Mutex<()>,
    /// Set once the agent was asked to exit; its exit is then not a crash
    pub exit_requested: AtomicBool,
    /// Stops the monitoring loops
    pub cancel: CancellationToken,
    pub monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagedSession {
    pub fn new(
        id: SessionId,
        agent_id: &str,
        working_dir: PathBuf,
        log_path: PathBuf,
        handle: Box<dyn SessionHandle>,
    ) -> Self {
        let pid = handle.pid();
        let output = handle.output_buffer();
        Self {
            id,
            agent_id: agent_id.to_string(),
            working_dir,
            log_path,
            created_at: Utc::now(),
            pid,
            output,
            handle: Mutex::new(handle),
            record: Mutex::new(SessionRecord::new()),
            send_lock: tokio::sync::Mutex::new(()),
            exit_requested: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Lock the record, recovering from a poisoned lock
    pub fn record(&self) -> MutexGuard<'_, SessionRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn handle(&self) -> MutexGuard<'_, Box<dyn SessionHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn output(&self) -> MutexGuard<'_, RingBuffer> {
        self.output.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count new output as activity. Returns true when it woke an idle session.
    pub fn observe_output(&self) -> bool {
        let total = self.output().total_written();
        let mut record = self.record();
        if total == record.seen_output {
            return false;
        }
        record.seen_output = total;
        record.touch()
    }

    pub fn info(&self) -> SessionInfo {
        let record = self.record();
        SessionInfo {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            state: record.state,
            working_dir: self.working_dir.clone(),
            log_path: self.log_path.clone(),
            pid: self.pid,
            created_at: self.created_at,
            ended_at: record.ended_at,
            last_activity: record.last_activity_at,
            interactions: record.interactions,
            message_count: record.history.len(),
            tokens: record.tokens.clone(),
            performance: record.performance.clone(),
            resources: record.resources.clone(),
        }
    }
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub agent_id: String,
    pub state: SessionState,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub interactions: u64,
    pub message_count: usize,
    pub tokens: TokenUsage,
    pub performance: Performance,
    pub resources: ResourceStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_stats_track_peaks_and_averages() {
        let mut stats = ResourceStats::default();
        stats.record(ResourceSample {
            cpu_percent: 10.0,
            memory_bytes: 100,
        });
        stats.record(ResourceSample {
            cpu_percent: 30.0,
            memory_bytes: 300,
        });
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.peak_memory_bytes, 300);
        assert_eq!(stats.peak_cpu_percent, 30.0);
        assert!((stats.average_cpu_percent - 20.0).abs() < f64::EPSILON);
        assert!((stats.average_memory_bytes - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn touch_wakes_idle_session() {
        let mut record = SessionRecord::new();
        assert!(!record.touch());
        record.state = SessionState::Idle;
        assert!(record.touch());
        assert_eq!(record.state, SessionState::Running);
    }
}
