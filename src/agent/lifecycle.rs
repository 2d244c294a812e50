//! Agent lifecycle manager
//!
//! Owns the registry and drives each agent through
//! `stopped -> spawning -> running <-> idle -> stopping -> stopped`, with
//! `error` reachable from spawning, running and idle. Sessions are created
//! and destroyed through the [`ProcessSupervisor`]; everything that happens
//! is published on the lifecycle channel.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::protocol::{self, TaskOutcome};
use super::registry::{ActiveTaskGuard, AgentEntry, AgentPhase, AgentRegistry};
use super::{
    AgentConfig, AgentState, AgentStatus, AgentType, HealthCheckPolicy, Task, TaskOptions,
    TaskResult,
};
use crate::accounting::{estimate_tokens, TokenAccountant, UsageRecord};
use crate::events::{Channel, Event, EventBus, EventKind};
use crate::supervisor::{
    MessagePriority, MessageType, ProcessSupervisor, TaskRecord, TerminationReason,
};
use crate::{AtelierError, Result};

const SOURCE: &str = "lifecycle";

/// How often task output is scanned for a completion marker
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct AgentLifecycleManager {
    supervisor: Arc<ProcessSupervisor>,
    accountant: Arc<dyn TokenAccountant>,
    events: EventBus,
    registry: AgentRegistry,
    /// Parent of every health loop and the supervisor bridge
    cancel: CancellationToken,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl AgentLifecycleManager {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        accountant: Arc<dyn TokenAccountant>,
    ) -> Arc<Self> {
        let events = supervisor.events().clone();
        Arc::new(Self {
            supervisor,
            accountant,
            events,
            registry: AgentRegistry::new(),
            cancel: CancellationToken::new(),
            bridge: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Add an agent in `stopped`. Duplicate ids are rejected.
    pub fn register_agent(&self, config: AgentConfig) -> Result<AgentStatus> {
        config.validate()?;
        let entry = self.registry.insert(config)?;
        let status = entry.status();

        tracing::info!(
            agent_id = %status.id,
            agent_type = %status.agent_type,
            priority = status.priority,
            "Agent registered"
        );
        self.emit(
            EventKind::AgentRegistered,
            json!({
                "agent_id": status.id,
                "agent_type": status.agent_type,
                "priority": status.priority,
            }),
        );
        Ok(status)
    }

    /// Replace an agent's configuration. Launch settings apply from the next spawn.
    pub async fn update_agent(&self, config: AgentConfig) -> Result<AgentStatus> {
        config.validate()?;
        let entry = self.registry.get(&config.id)?;
        let _transition = entry.transition.lock().await;
        if entry.is_retired() {
            return Err(AtelierError::NotRegistered(config.id));
        }
        tracing::info!(agent_id = %entry.id, "Agent configuration updated");
        entry.set_config(config);
        Ok(entry.status())
    }

    /// Start a session for a stopped (or recoverably errored) agent.
    pub async fn spawn_agent(self: &Arc<Self>, agent_id: &str) -> Result<AgentStatus> {
        let entry = self.registry.get(agent_id)?;
        let _transition = entry.transition.lock().await;
        if entry.is_retired() {
            return Err(AtelierError::NotRegistered(agent_id.to_string()));
        }

        match entry.phase() {
            AgentPhase::Stopped | AgentPhase::Error { fatal: false, .. } => {}
            AgentPhase::Error { reason, fatal: true } => {
                return Err(AtelierError::AgentFailed {
                    agent_id: agent_id.to_string(),
                    reason,
                });
            }
            other => {
                return Err(AtelierError::AlreadyRunning {
                    agent_id: agent_id.to_string(),
                    state: other.state().to_string(),
                });
            }
        }

        let config = entry.config();
        if !config.enabled {
            return Err(AtelierError::AgentDisabled(agent_id.to_string()));
        }
        let working_dir = match &config.working_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        entry.set_phase(AgentPhase::Spawning);
        tracing::info!(agent_id = %agent_id, agent_type = %config.agent_type, "Spawning agent");
        self.emit(
            EventKind::AgentSpawning,
            json!({ "agent_id": agent_id, "agent_type": config.agent_type }),
        );

        let created = self
            .supervisor
            .create_session(
                agent_id,
                &config.launch_config(),
                config.instructions.as_deref(),
                &working_dir,
            )
            .await;

        let session_id = match created {
            Ok(session_id) => session_id,
            Err(e) => {
                {
                    let mut record = entry.record_mut();
                    record.phase = AgentPhase::Error {
                        reason: e.to_string(),
                        fatal: false,
                    };
                    record.error_count += 1;
                    record.last_activity = Utc::now();
                }
                tracing::error!(agent_id = %agent_id, "Spawn failed: {}", e);
                self.emit(
                    EventKind::AgentError,
                    json!({ "agent_id": agent_id, "kind": e.kind(), "error": e.to_string() }),
                );
                return Err(e);
            }
        };

        let started_at = Utc::now();
        entry.set_phase(AgentPhase::Active {
            session_id: session_id.clone(),
            started_at,
            since: Instant::now(),
            idle: false,
        });
        if config.health_check.enabled {
            self.start_health_loop(&entry, &session_id, config.health_check.clone());
        }

        tracing::info!(agent_id = %agent_id, session_id = %session_id, "Agent spawned");
        self.emit(
            EventKind::AgentSpawned,
            json!({
                "agent_id": agent_id,
                "session_id": session_id,
                "start_time": started_at,
            }),
        );
        Ok(entry.status())
    }

    /// Send a task to a running agent and wait for its completion marker.
    ///
    /// A timeout abandons the wait only; the agent stays in its current state.
    pub async fn execute_task(
        &self,
        agent_id: &str,
        task: Task,
        options: TaskOptions,
    ) -> Result<TaskResult> {
        let entry = self.registry.get(agent_id)?;
        let (state, session_id) = {
            let record = entry.record();
            (
                record.phase.state(),
                record.phase.session_id().map(str::to_string),
            )
        };
        let session_id = match session_id {
            Some(id) if state.is_available() => id,
            _ => {
                return Err(AtelierError::NotRunning {
                    agent_id: agent_id.to_string(),
                    state: state.to_string(),
                });
            }
        };

        let config = entry.config();
        let timeout = options
            .timeout
            .unwrap_or_else(|| config.resources.max_execution());
        let instruction = protocol::render_instruction(&task);
        let input_tokens = estimate_tokens(&instruction);

        if options.track_tokens {
            if let Err(e) = check_token_limits(&entry, &config, input_tokens) {
                tracing::warn!(agent_id = %agent_id, task_id = %task.id, "{}", e);
                self.emit_task_failed(agent_id, &task, &e);
                return Err(e);
            }
        }

        let _active = ActiveTaskGuard::new(entry.clone());
        let started = Instant::now();
        tracing::info!(
            agent_id = %agent_id,
            task_id = %task.id,
            task_type = %task.task_type,
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching task"
        );

        let run = async {
            let cursor = self.supervisor.output_cursor(&session_id)?;
            self.supervisor
                .send_message(
                    &session_id,
                    &instruction,
                    MessageType::Instruction,
                    MessagePriority::Normal,
                )
                .await?;
            self.await_outcome(&session_id, cursor, &task.id).await
        };

        let (outcome, text) = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(agent_id = %agent_id, task_id = %task.id, "Task failed: {}", e);
                entry.record_mut().error_count += 1;
                self.emit_task_failed(agent_id, &task, &e);
                return Err(e);
            }
            Err(_) => {
                let e = AtelierError::TaskTimeout {
                    agent_id: agent_id.to_string(),
                    task_id: task.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                tracing::warn!(agent_id = %agent_id, task_id = %task.id, "{}", e);
                self.emit_task_failed(agent_id, &task, &e);
                return Err(e);
            }
        };

        let duration = started.elapsed();
        let output = protocol::extract_output(&text, &task.id);
        let success = outcome == TaskOutcome::Done;

        let (tokens_used, cost) = if options.track_tokens {
            let usage = UsageRecord {
                agent_id: agent_id.to_string(),
                operation: format!("task:{}", task.task_type),
                input_tokens,
                output_tokens: estimate_tokens(&output),
                model: config.model_name().to_string(),
            };
            let cost = match self.accountant.record_usage(&usage).await {
                Ok(cost) => cost.max(0.0),
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, "Token accounting failed: {}", e);
                    0.0
                }
            };
            (usage.total_tokens(), cost)
        } else {
            (0, 0.0)
        };

        let (before, after) = {
            let mut record = entry.record_mut();
            let before = record.daily.current();
            record.daily.tokens = before + tokens_used;
            record.total_cost += cost;
            record.last_activity = Utc::now();
            if !success {
                record.error_count += 1;
            }
            (before, record.daily.tokens)
        };
        self.check_token_alerts(agent_id, &config, before, after);

        let record = TaskRecord {
            duration,
            tokens: tokens_used,
            cost,
            success,
        };
        if let Err(e) = self.supervisor.record_task(&session_id, record) {
            tracing::debug!(agent_id = %agent_id, "Task stats not recorded: {}", e);
        }
        if !output.is_empty() {
            if let Err(e) =
                self.supervisor
                    .record_agent_message(&session_id, &output, MessageType::Status)
            {
                tracing::debug!(agent_id = %agent_id, "Task output not recorded: {}", e);
            }
        }

        let result = TaskResult {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            success,
            output,
            tokens_used,
            cost,
            duration,
        };

        if success {
            tracing::info!(
                agent_id = %agent_id,
                task_id = %task.id,
                duration_ms = duration.as_millis() as u64,
                tokens = tokens_used,
                "Task completed"
            );
            self.emit(
                EventKind::TaskCompleted,
                json!({
                    "agent_id": agent_id,
                    "task_id": task.id,
                    "task_type": task.task_type,
                    "duration_ms": duration.as_millis() as u64,
                    "tokens_used": tokens_used,
                    "cost": cost,
                }),
            );
        } else {
            tracing::warn!(agent_id = %agent_id, task_id = %task.id, "Agent reported task failure");
            self.emit(
                EventKind::TaskFailed,
                json!({
                    "agent_id": agent_id,
                    "task_id": task.id,
                    "task_type": task.task_type,
                    "kind": "task_failed",
                    "error": "agent reported failure",
                }),
            );
        }
        Ok(result)
    }

    /// Stop an agent and destroy its session.
    ///
    /// A graceful stop sends the shutdown command and waits up to the
    /// supervisor's grace period before forcing. Stopping a stopped agent is
    /// a no-op; stopping an errored one clears the error.
    pub async fn stop_agent(&self, agent_id: &str, graceful: bool) -> Result<AgentStatus> {
        let entry = self.registry.get(agent_id)?;
        let _transition = entry.transition.lock().await;

        let (session_id, started_at, since) = match entry.phase() {
            AgentPhase::Stopped => return Ok(entry.status()),
            AgentPhase::Spawning | AgentPhase::Error { .. } => {
                entry.replace_health(None);
                entry.set_phase(AgentPhase::Stopped);
                tracing::info!(agent_id = %agent_id, "Agent reset to stopped");
                self.emit(
                    EventKind::AgentStopped,
                    json!({ "agent_id": agent_id, "session_id": Value::Null, "reason": "reset" }),
                );
                return Ok(entry.status());
            }
            AgentPhase::Active {
                session_id,
                started_at,
                since,
                ..
            }
            | AgentPhase::Stopping {
                session_id,
                started_at,
                since,
            } => (session_id, started_at, since),
        };

        entry.set_phase(AgentPhase::Stopping {
            session_id: session_id.clone(),
            started_at,
            since,
        });
        entry.replace_health(None);
        tracing::info!(agent_id = %agent_id, session_id = %session_id, graceful, "Stopping agent");
        self.emit(
            EventKind::AgentStopping,
            json!({ "agent_id": agent_id, "session_id": session_id, "graceful": graceful }),
        );

        let reason = if graceful {
            let grace = self.supervisor.config().shutdown_grace();
            match self.supervisor.request_shutdown(&session_id, grace).await {
                Ok(true) => TerminationReason::Graceful,
                Ok(false) => {
                    tracing::warn!(agent_id = %agent_id, "Grace period elapsed, forcing stop");
                    TerminationReason::Requested
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, "Shutdown request failed: {}", e);
                    TerminationReason::Requested
                }
            }
        } else {
            TerminationReason::Requested
        };

        if let Err(e) = self.supervisor.terminate_session(&session_id, reason).await {
            tracing::warn!(agent_id = %agent_id, "Session teardown failed: {}", e);
        }

        entry.set_phase(AgentPhase::Stopped);
        tracing::info!(agent_id = %agent_id, reason = reason.as_str(), "Agent stopped");
        self.emit(
            EventKind::AgentStopped,
            json!({ "agent_id": agent_id, "session_id": session_id, "reason": reason.as_str() }),
        );
        Ok(entry.status())
    }

    /// Delete a stopped agent from the registry.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let entry = self.registry.get(agent_id)?;
        let _transition = entry.transition.lock().await;
        let state = entry.state();
        if state != AgentState::Stopped {
            return Err(AtelierError::StillRunning {
                agent_id: agent_id.to_string(),
                state: state.to_string(),
            });
        }
        entry.retired.store(true, Ordering::SeqCst);
        entry.replace_health(None);
        self.registry.remove(agent_id);

        tracing::info!(agent_id = %agent_id, "Agent removed");
        self.emit(EventKind::AgentRemoved, json!({ "agent_id": agent_id }));
        Ok(())
    }

    pub fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        Ok(self.registry.get(agent_id)?.status())
    }

    /// Every agent in registration order
    pub fn get_all_agents_status(&self) -> Vec<AgentStatus> {
        self.registry.all().iter().map(|e| e.status()).collect()
    }

    pub fn get_agents_by_type(&self, agent_type: &AgentType) -> Vec<AgentStatus> {
        self.get_all_agents_status()
            .into_iter()
            .filter(|s| &s.agent_type == agent_type)
            .collect()
    }

    /// Highest-priority running or idle agent, earliest registration on ties
    pub fn get_best_agent(&self, agent_type: Option<&AgentType>) -> Option<AgentStatus> {
        self.eligible_agents(agent_type).into_iter().next()
    }

    /// Enabled running/idle agents, best first
    pub fn eligible_agents(&self, agent_type: Option<&AgentType>) -> Vec<AgentStatus> {
        self.ranked(agent_type, |s| s.enabled && s.state.is_available())
    }

    /// Enabled stopped agents that could be spawned, best first
    pub fn spawn_candidates(&self, agent_type: Option<&AgentType>) -> Vec<AgentStatus> {
        self.ranked(agent_type, |s| s.enabled && s.state == AgentState::Stopped)
    }

    /// Agents that currently hold a session
    pub fn active_agent_count(&self) -> usize {
        self.registry
            .all()
            .iter()
            .filter(|e| e.state().has_session())
            .count()
    }

    fn ranked(
        &self,
        agent_type: Option<&AgentType>,
        keep: impl Fn(&AgentStatus) -> bool,
    ) -> Vec<AgentStatus> {
        let mut agents: Vec<AgentStatus> = self
            .get_all_agents_status()
            .into_iter()
            .filter(|s| agent_type.is_none_or(|t| &s.agent_type == t))
            .filter(|s| keep(s))
            .collect();
        agents.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.registration.cmp(&b.registration))
        });
        agents
    }

    /// Follow supervisor events: idle flips and unexpected session exits.
    ///
    /// Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut bridge = self.bridge.lock().unwrap_or_else(|e| e.into_inner());
        if bridge.is_some() {
            return;
        }
        let mut rx = self.events.subscribe(Channel::Tmux);
        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        *bridge = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Lifecycle bridge lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.on_session_event(event);
            }
        }));
    }

    /// Stop the bridge and every agent, then the supervisor.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let bridge = self
            .bridge
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(bridge) = bridge {
            let _ = bridge.await;
        }

        for entry in self.registry.all() {
            if entry.state() == AgentState::Stopped {
                continue;
            }
            if let Err(e) = self.stop_agent(&entry.id, true).await {
                tracing::warn!(agent_id = %entry.id, "Stop during shutdown failed: {}", e);
            }
        }
        self.supervisor.shutdown().await;
    }

    fn on_session_event(self: Arc<Self>, event: Event) {
        let (Some(agent_id), Some(session_id)) =
            (event.data_str("agent_id"), event.data_str("session_id"))
        else {
            return;
        };
        let Ok(entry) = self.registry.get(agent_id) else {
            return;
        };

        match event.kind {
            EventKind::IdleDetected => set_idle(&entry, session_id, true),
            EventKind::IdleCleared => set_idle(&entry, session_id, false),
            EventKind::SessionTerminated
                if event.data_str("reason") == Some(TerminationReason::Error.as_str()) =>
            {
                // Takes the transition lock; keep the bridge moving meanwhile
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    self.mark_crashed(&entry, &session_id).await;
                });
            }
            _ => {}
        }
    }

    fn start_health_loop(
        self: &Arc<Self>,
        entry: &Arc<AgentEntry>,
        session_id: &str,
        policy: HealthCheckPolicy,
    ) {
        let token = self.cancel.child_token();
        entry.replace_health(Some(token.clone()));
        tokio::spawn(health_loop(
            Arc::downgrade(self),
            entry.clone(),
            session_id.to_string(),
            policy,
            token,
        ));
    }

    /// The session vanished underneath a running agent
    async fn mark_crashed(&self, entry: &Arc<AgentEntry>, session_id: &str) {
        let _transition = entry.transition.lock().await;
        let current = entry.record().phase.is_session(session_id);
        if !current {
            return;
        }
        entry.replace_health(None);
        let reason = "session terminated unexpectedly".to_string();
        {
            let mut record = entry.record_mut();
            record.phase = AgentPhase::Error {
                reason: reason.clone(),
                fatal: false,
            };
            record.error_count += 1;
            record.last_activity = Utc::now();
        }
        tracing::error!(agent_id = %entry.id, session_id = %session_id, "Agent session crashed");
        self.emit(
            EventKind::AgentError,
            json!({
                "agent_id": entry.id,
                "session_id": session_id,
                "kind": "session",
                "error": reason,
            }),
        );
    }

    /// Health checks gave up: tear the session down and park the agent in `error`
    async fn fail_health(&self, entry: &Arc<AgentEntry>, session_id: &str, failures: u32) {
        let _transition = entry.transition.lock().await;
        let current = entry.record().phase.is_session(session_id);
        if !current {
            return;
        }
        entry.replace_health(None);

        if let Err(e) = self
            .supervisor
            .terminate_session(session_id, TerminationReason::HealthCheckFailed)
            .await
        {
            tracing::warn!(agent_id = %entry.id, "Session teardown failed: {}", e);
        }

        {
            let mut record = entry.record_mut();
            record.phase = AgentPhase::Error {
                reason: format!("{} consecutive health check failures", failures),
                fatal: true,
            };
            record.error_count += 1;
            record.last_activity = Utc::now();
        }
        tracing::error!(agent_id = %entry.id, failures, "Agent failed health checks");
        self.emit(
            EventKind::AgentHealthFailed,
            json!({ "agent_id": entry.id, "session_id": session_id, "failures": failures }),
        );
    }

    async fn await_outcome(
        &self,
        session_id: &str,
        cursor: usize,
        task_id: &str,
    ) -> Result<(TaskOutcome, String)> {
        loop {
            let text = self.supervisor.capture_output_since(session_id, cursor)?;
            if let Some(outcome) = protocol::find_outcome(&text, task_id) {
                return Ok((outcome, text));
            }
            tokio::time::sleep(OUTPUT_POLL_INTERVAL).await;
        }
    }

    fn check_token_alerts(&self, agent_id: &str, config: &AgentConfig, before: u64, after: u64) {
        let Some(limit) = config.token_limits.daily_limit.filter(|l| *l > 0) else {
            return;
        };
        let crossed = |fraction: f64| {
            let mark = fraction * limit as f64;
            (before as f64) < mark && (after as f64) >= mark
        };
        let level = if crossed(config.token_limits.critical_threshold) {
            "critical"
        } else if crossed(config.token_limits.warning_threshold) {
            "warning"
        } else {
            return;
        };
        tracing::warn!(agent_id = %agent_id, level, tokens_today = after, limit, "Token usage alert");
        self.emit(
            EventKind::TokenAlert,
            json!({
                "agent_id": agent_id,
                "level": level,
                "tokens_today": after,
                "daily_limit": limit,
            }),
        );
    }

    fn emit_task_failed(&self, agent_id: &str, task: &Task, error: &AtelierError) {
        self.emit(
            EventKind::TaskFailed,
            json!({
                "agent_id": agent_id,
                "task_id": task.id,
                "task_type": task.task_type,
                "kind": error.kind(),
                "error": error.to_string(),
            }),
        );
    }

    fn emit(&self, kind: EventKind, data: Value) {
        self.events.emit(kind, SOURCE, data);
    }
}

fn set_idle(entry: &AgentEntry, session_id: &str, value: bool) {
    let mut guard = entry.record_mut();
    let record = &mut *guard;
    if let AgentPhase::Active {
        session_id: current,
        idle,
        ..
    } = &mut record.phase
    {
        if current == session_id && *idle != value {
            *idle = value;
            record.last_activity = Utc::now();
            tracing::debug!(agent_id = %entry.id, idle = value, "Agent activity changed");
        }
    }
}

/// Reject work that would break the agent's token budget
fn check_token_limits(entry: &AgentEntry, config: &AgentConfig, input_tokens: u64) -> Result<()> {
    let limits = &config.token_limits;
    let exceeded = |message: String| AtelierError::TokenLimit {
        agent_id: entry.id.clone(),
        message,
    };

    if let Some(limit) = limits.per_request_limit {
        if input_tokens > limit {
            return Err(exceeded(format!(
                "request needs ~{} tokens, per-request limit is {}",
                input_tokens, limit
            )));
        }
    }

    let mut record = entry.record_mut();
    let today = record.daily.current();
    if let Some(limit) = limits.daily_limit {
        if today + input_tokens > limit {
            return Err(exceeded(format!(
                "{} tokens used today, daily limit is {}",
                today, limit
            )));
        }
    }
    if let Some(ceiling) = limits.cost_ceiling {
        if record.total_cost >= ceiling {
            return Err(exceeded(format!(
                "cost {:.4} reached ceiling {:.4}",
                record.total_cost, ceiling
            )));
        }
    }
    Ok(())
}

async fn health_loop(
    manager: Weak<AgentLifecycleManager>,
    entry: Arc<AgentEntry>,
    session_id: String,
    policy: HealthCheckPolicy,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(policy.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let current = entry.record().phase.is_session(&session_id);
        if !current {
            break;
        }

        let probe = tokio::time::timeout(
            policy.timeout(),
            manager.supervisor.probe_session(&session_id),
        )
        .await;
        match probe {
            Ok(Ok(true)) => failures = 0,
            Ok(Ok(false)) | Ok(Err(AtelierError::SessionNotFound(_))) => {
                // Either this probe or the supervisor's own monitor tore it down
                manager.mark_crashed(&entry, &session_id).await;
                break;
            }
            Ok(Err(e)) => {
                failures += 1;
                tracing::warn!(agent_id = %entry.id, failures, "Health probe failed: {}", e);
            }
            Err(_) => {
                failures += 1;
                tracing::warn!(agent_id = %entry.id, failures, "Health probe timed out");
            }
        }
        if failures >= policy.max_failures {
            manager.fail_health(&entry, &session_id, failures).await;
            break;
        }
    }
}
