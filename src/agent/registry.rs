//! Agent registry - one authoritative entry per agent id
//!
//! Reads never wait on a transition: the record sits behind a short-lived
//! lock, while state transitions for one agent are serialized by a separate
//! async mutex held for the whole spawn/stop/remove sequence.

use super::{AgentConfig, AgentState, AgentStatus};
use crate::{AtelierError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where an agent is in its lifecycle, with the data each state carries.
///
/// A start time only exists while a session is up.
#[derive(Debug, Clone)]
pub enum AgentPhase {
    Stopped,
    Spawning,
    Active {
        session_id: String,
        started_at: DateTime<Utc>,
        since: Instant,
        idle: bool,
    },
    Stopping {
        session_id: String,
        started_at: DateTime<Utc>,
        since: Instant,
    },
    Error {
        reason: String,
        fatal: bool,
    },
}

impl AgentPhase {
    pub fn state(&self) -> AgentState {
        match self {
            AgentPhase::Stopped => AgentState::Stopped,
            AgentPhase::Spawning => AgentState::Spawning,
            AgentPhase::Active { idle: false, .. } => AgentState::Running,
            AgentPhase::Active { idle: true, .. } => AgentState::Idle,
            AgentPhase::Stopping { .. } => AgentState::Stopping,
            AgentPhase::Error { .. } => AgentState::Error,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentPhase::Active { session_id, .. } | AgentPhase::Stopping { session_id, .. } => {
                Some(session_id)
            }
            _ => None,
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            AgentPhase::Active { started_at, .. } | AgentPhase::Stopping { started_at, .. } => {
                Some(*started_at)
            }
            _ => None,
        }
    }

    fn since(&self) -> Option<Instant> {
        match self {
            AgentPhase::Active { since, .. } | AgentPhase::Stopping { since, .. } => Some(*since),
            _ => None,
        }
    }

    /// Active on exactly this session
    pub fn is_session(&self, id: &str) -> bool {
        matches!(self, AgentPhase::Active { session_id, .. } if session_id == id)
    }
}

/// Token usage for the current UTC day
#[derive(Debug, Clone)]
pub(crate) struct DailyTokens {
    pub date: NaiveDate,
    pub tokens: u64,
}

impl DailyTokens {
    fn today() -> Self {
        Self {
            date: Utc::now().date_naive(),
            tokens: 0,
        }
    }

    /// Usage for today, resetting on a new day
    pub fn current(&mut self) -> u64 {
        let today = Utc::now().date_naive();
        if self.date != today {
            self.date = today;
            self.tokens = 0;
        }
        self.tokens
    }
}

/// Mutable runtime status of one agent
#[derive(Debug)]
pub(crate) struct AgentRecord {
    pub phase: AgentPhase,
    pub last_activity: DateTime<Utc>,
    pub error_count: u64,
    pub daily: DailyTokens,
    pub total_cost: f64,
}

pub(crate) struct AgentEntry {
    pub id: String,
    pub seq: u64,
    config: RwLock<AgentConfig>,
    record: RwLock<AgentRecord>,
    /// At most one state transition in flight per agent
    pub transition: tokio::sync::Mutex<()>,
    /// Set once removed; a stale handle must not resurrect the agent
    pub retired: AtomicBool,
    pub active_tasks: AtomicUsize,
    /// Cancels the health loop of the current session
    health: Mutex<Option<CancellationToken>>,
}

impl AgentEntry {
    fn new(config: AgentConfig, seq: u64) -> Self {
        Self {
            id: config.id.clone(),
            seq,
            config: RwLock::new(config),
            record: RwLock::new(AgentRecord {
                phase: AgentPhase::Stopped,
                last_activity: Utc::now(),
                error_count: 0,
                daily: DailyTokens::today(),
                total_cost: 0.0,
            }),
            transition: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            health: Mutex::new(None),
        }
    }

    pub fn config(&self) -> AgentConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_config(&self, config: AgentConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn record(&self) -> RwLockReadGuard<'_, AgentRecord> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_mut(&self) -> RwLockWriteGuard<'_, AgentRecord> {
        self.record.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> AgentPhase {
        self.record().phase.clone()
    }

    pub fn state(&self) -> AgentState {
        self.record().phase.state()
    }

    pub fn set_phase(&self, phase: AgentPhase) {
        let mut record = self.record_mut();
        record.phase = phase;
        record.last_activity = Utc::now();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn replace_health(&self, token: Option<CancellationToken>) {
        let previous = std::mem::replace(
            &mut *self.health.lock().unwrap_or_else(|e| e.into_inner()),
            token,
        );
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn status(&self) -> AgentStatus {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        let record = self.record();
        let last_error = match &record.phase {
            AgentPhase::Error { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        AgentStatus {
            id: self.id.clone(),
            agent_type: config.agent_type.clone(),
            enabled: config.enabled,
            priority: config.priority,
            registration: self.seq,
            state: record.phase.state(),
            start_time: record.phase.start_time(),
            last_activity: record.last_activity,
            error_count: record.error_count,
            uptime: record
                .phase
                .since()
                .map(|since| since.elapsed())
                .unwrap_or_default(),
            session_id: record.phase.session_id().map(str::to_string),
            active_tasks: self.active_tasks.load(Ordering::SeqCst),
            tokens_today: record.daily.tokens,
            total_cost: record.total_cost,
            last_error,
        }
    }
}

/// Counts a task as in flight until dropped
pub(crate) struct ActiveTaskGuard(Arc<AgentEntry>);

impl ActiveTaskGuard {
    pub fn new(entry: Arc<AgentEntry>) -> Self {
        entry.active_tasks.fetch_add(1, Ordering::SeqCst);
        Self(entry)
    }
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.0.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of agent configurations and runtime status
pub struct AgentRegistry {
    entries: RwLock<HashMap<String, Arc<AgentEntry>>>,
    next_seq: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn insert(&self, config: AgentConfig) -> Result<Arc<AgentEntry>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&config.id) {
            return Err(AtelierError::DuplicateAgent(config.id));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(AgentEntry::new(config, seq));
        entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    pub(crate) fn get(&self, id: &str) -> Result<Arc<AgentEntry>> {
        self.entries()
            .get(id)
            .cloned()
            .ok_or_else(|| AtelierError::NotRegistered(id.to_string()))
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<AgentEntry>> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// All entries in registration order
    pub(crate) fn all(&self) -> Vec<Arc<AgentEntry>> {
        let mut all: Vec<_> = self.entries().values().cloned().collect();
        all.sort_by_key(|e| e.seq);
        all
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<AgentEntry>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentType;

    #[test]
    fn duplicate_ids_leave_one_entry() {
        let registry = AgentRegistry::new();
        registry
            .insert(AgentConfig::new("dev-1", AgentType::Developer))
            .unwrap();
        let err = registry
            .insert(AgentConfig::new("dev-1", AgentType::Qa))
            .err()
            .unwrap();
        assert!(matches!(err, AtelierError::DuplicateAgent(ref id) if id == "dev-1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("dev-1").unwrap().config().agent_type,
            AgentType::Developer
        );
    }

    #[test]
    fn entries_keep_registration_order() {
        let registry = AgentRegistry::new();
        for id in ["c", "a", "b"] {
            registry
                .insert(AgentConfig::new(id, AgentType::Analyst))
                .unwrap();
        }
        let ids: Vec<_> = registry.all().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn start_time_only_while_session_is_up() {
        let active = AgentPhase::Active {
            session_id: "ses-1".into(),
            started_at: Utc::now(),
            since: Instant::now(),
            idle: true,
        };
        assert_eq!(active.state(), AgentState::Idle);
        assert!(active.start_time().is_some());
        assert!(active.is_session("ses-1"));
        assert!(AgentPhase::Stopped.start_time().is_none());
        assert!(
            AgentPhase::Error {
                reason: "x".into(),
                fatal: false
            }
            .start_time()
            .is_none()
        );
    }

    #[test]
    fn active_task_guard_counts() {
        let registry = AgentRegistry::new();
        let entry = registry
            .insert(AgentConfig::new("qa-1", AgentType::Qa))
            .unwrap();
        {
            let _a = ActiveTaskGuard::new(entry.clone());
            let _b = ActiveTaskGuard::new(entry.clone());
            assert_eq!(entry.status().active_tasks, 2);
        }
        assert_eq!(entry.status().active_tasks, 0);
    }
}
