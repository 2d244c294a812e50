//! Process supervisor - one isolated terminal session per agent
//!
//! The supervisor owns every execution session: it creates them through a
//! [`SessionBackend`], forwards instructions, captures output, watches
//! resources and idleness, and tears sessions down.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  create/send/capture  ┌──────────────────────┐
//! │  Lifecycle manager   │──────────────────────►│  ProcessSupervisor   │
//! └──────────────────────┘                       │  ┌────────────────┐  │
//!            ▲                                   │  │ ManagedSession │──┼─► backend (PTY)
//!            │  session.* / idle.* / resource.*  │  │  ├ resources   │  │
//!            └───────────── EventBus ◄───────────┼──│  └ idle        │  │
//!                                                │  └────────────────┘  │
//!                                                └──────────────────────┘
//! ```

pub mod backend;
pub mod buffer;
pub mod inspector;
pub mod logger;
mod monitor;
pub mod pty;
mod session;

pub use backend::{
    generate_session_id, LaunchConfig, LaunchSpec, ProcessStatus, SessionBackend, SessionHandle,
    SessionId,
};
pub use buffer::RingBuffer;
pub use inspector::{ProcessInspector, PsInspector, ResourceSample};
pub use logger::SessionLogger;
pub use pty::PtyBackend;
pub use session::{
    Message, MessageDirection, MessagePriority, MessageType, Performance, ResourceStats,
    SessionInfo, SessionState, TerminationReason, TokenUsage,
};

use crate::config::SupervisorConfig;
use crate::events::{EventBus, EventKind};
use crate::{AtelierError, Result};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use monitor::{emit_idle_cleared, spawn_idle_monitor, spawn_resource_monitor, MonitorContext, SOURCE};
use session::ManagedSession;

/// How often a graceful shutdown re-checks the process
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one task, folded into a session's accumulators
#[derive(Debug, Clone, Copy)]
pub struct TaskRecord {
    pub duration: Duration,
    pub tokens: u64,
    pub cost: f64,
    pub success: bool,
}

/// Manages all active agent sessions
pub struct ProcessSupervisor {
    backend: Arc<dyn SessionBackend>,
    monitor: Arc<MonitorContext>,
    log_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        inspector: Arc<dyn ProcessInspector>,
        events: EventBus,
        config: SupervisorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let log_dir = match &config.log_dir {
            Some(dir) => dir.clone(),
            None => logger::default_logs_dir()?,
        };
        Ok(Self {
            backend,
            monitor: Arc::new(MonitorContext {
                inspector,
                events,
                config,
                sessions: RwLock::new(HashMap::new()),
            }),
            log_dir,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.monitor.config
    }

    pub fn events(&self) -> &EventBus {
        &self.monitor.events
    }

    /// Create a session for `agent_id` and send it its initial instructions.
    ///
    /// Starts the resource and idle monitors. Any failure to bring up the
    /// backing process is a `SessionCreation` error and is not retried.
    pub async fn create_session(
        &self,
        agent_id: &str,
        launch: &LaunchConfig,
        instructions: Option<&str>,
        working_dir: &Path,
    ) -> Result<SessionId> {
        let session_id = generate_session_id();
        let logger = SessionLogger::create(&self.log_dir, &session_id)
            .map_err(|e| AtelierError::SessionCreation(format!("log file: {}", e)))?;
        let log_path = logger.path().to_path_buf();

        let spec = LaunchSpec::new(
            session_id.clone(),
            agent_id,
            launch,
            working_dir.to_path_buf(),
            self.config().buffer_capacity,
            logger,
        );
        let backend = self.backend.clone();
        let handle = tokio::task::spawn_blocking(move || backend.launch(spec))
            .await
            .map_err(|e| AtelierError::SessionCreation(e.to_string()))?
            .map_err(|e| match e {
                AtelierError::SessionCreation(_) => e,
                other => AtelierError::SessionCreation(other.to_string()),
            })?;

        let session = Arc::new(ManagedSession::new(
            session_id.clone(),
            agent_id,
            working_dir.to_path_buf(),
            log_path.clone(),
            handle,
        ));
        self.sessions_mut()
            .insert(session_id.clone(), session.clone());

        tracing::info!(
            session_id = %session_id,
            agent_id = %agent_id,
            backend = self.backend.name(),
            "Session created"
        );
        self.events().emit(
            EventKind::SessionCreated,
            SOURCE,
            json!({
                "session_id": session_id,
                "agent_id": agent_id,
                "pid": session.pid,
                "log_path": log_path,
                "working_dir": working_dir,
            }),
        );

        if let Some(text) = instructions.filter(|t| !t.trim().is_empty()) {
            if let Err(e) = self
                .send_message(&session_id, text, MessageType::Instruction, MessagePriority::High)
                .await
            {
                if let Err(teardown) = self
                    .terminate_session(&session_id, TerminationReason::Error)
                    .await
                {
                    tracing::warn!(session_id = %session_id, "Teardown after failed start: {}", teardown);
                }
                return Err(AtelierError::SessionCreation(format!(
                    "initial instructions: {}",
                    e
                )));
            }
        }

        let mut monitors = session.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.push(spawn_resource_monitor(session.clone(), self.monitor.clone()));
        monitors.push(spawn_idle_monitor(session.clone(), self.monitor.clone()));
        drop(monitors);

        Ok(session_id)
    }

    /// Forward a message to the session's input and append it to the history.
    ///
    /// The history entry is written together with the input, so a message
    /// the agent received is recorded even if the caller stops waiting.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> Result<Message> {
        let session = self.get(session_id)?;
        let _order = session.send_lock.lock().await;

        let message = Message::to_agent(content, message_type, priority);
        let mut payload = content.as_bytes().to_vec();
        payload.push(b'\n');

        let written = session.clone();
        let entry = message.clone();
        let woke = match self
            .with_handle(&session, move |h| {
                h.write(&payload)?;
                let mut record = written.record();
                record.history.push(entry);
                record.interactions += 1;
                Ok(record.touch())
            })
            .await
        {
            Ok(woke) => woke,
            Err(e) => {
                self.emit_error(&session, &e);
                return Err(e);
            }
        };
        if woke {
            emit_idle_cleared(self.events(), &session);
        }

        tracing::debug!(
            session_id = %session_id,
            message_id = %message.id,
            bytes = content.len(),
            "Message sent"
        );
        self.events().emit(
            EventKind::AgentMessage,
            SOURCE,
            json!({
                "session_id": session.id,
                "agent_id": session.agent_id,
                "message_id": message.id,
                "direction": MessageDirection::ToAgent,
                "message_type": message_type,
                "priority": priority,
            }),
        );
        Ok(message)
    }

    /// Record something the agent reported back (task results, status).
    pub fn record_agent_message(
        &self,
        session_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let session = self.get(session_id)?;
        let message = Message {
            direction: MessageDirection::FromAgent,
            ..Message::to_agent(content, message_type, MessagePriority::Normal)
        };
        session.record().history.push(message.clone());
        self.events().emit(
            EventKind::AgentMessage,
            SOURCE,
            json!({
                "session_id": session.id,
                "agent_id": session.agent_id,
                "message_id": message.id,
                "direction": MessageDirection::FromAgent,
                "message_type": message_type,
            }),
        );
        Ok(message)
    }

    /// Read buffered output, optionally only the last `lines` lines.
    pub fn capture_output(&self, session_id: &str, lines: Option<usize>) -> Result<String> {
        let session = self.get(session_id)?;
        self.observe(&session);
        let text = clean_output(&session.output().read_all());
        Ok(match lines {
            Some(n) => last_lines(&text, n),
            None => text,
        })
    }

    /// Absolute output offset; pair with [`capture_output_since`](Self::capture_output_since)
    pub fn output_cursor(&self, session_id: &str) -> Result<usize> {
        Ok(self.get(session_id)?.output().total_written())
    }

    /// Output written after `cursor` that is still retained
    pub fn capture_output_since(&self, session_id: &str, cursor: usize) -> Result<String> {
        let session = self.get(session_id)?;
        self.observe(&session);
        let bytes = session.output().read_since(cursor);
        Ok(clean_output(&bytes))
    }

    /// Stop monitoring, kill the backing process and forget the session.
    ///
    /// Terminating a session that is already gone is a no-op.
    pub async fn terminate_session(&self, session_id: &str, reason: TerminationReason) -> Result<()> {
        let removed = self.sessions_mut().remove(session_id);
        let Some(session) = removed else {
            tracing::debug!(session_id = %session_id, "Session already terminated");
            return Ok(());
        };
        self.teardown(session, reason).await;
        Ok(())
    }

    /// Ask the agent to exit and wait up to `grace` for it to do so.
    ///
    /// Returns whether the process exited on its own. The session stays
    /// registered either way; callers follow up with `terminate_session`.
    pub async fn request_shutdown(&self, session_id: &str, grace: Duration) -> Result<bool> {
        let command = self.config().shutdown_command.clone();
        self.get(session_id)?
            .exit_requested
            .store(true, Ordering::SeqCst);
        self.send_message(session_id, &command, MessageType::Instruction, MessagePriority::Urgent)
            .await?;

        let session = self.get(session_id)?;
        let deadline = Instant::now() + grace;
        loop {
            let status = self.with_handle(&session, |h| Ok(h.poll())).await?;
            if !status.is_running() {
                tracing::info!(session_id = %session_id, ?status, "Agent exited after shutdown request");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Check the backing process still exists.
    ///
    /// A missing process is an unexpected crash: the session is torn down
    /// with reason `error` and `false` is returned. A process that exited
    /// after [`request_shutdown`](Self::request_shutdown) is left for the
    /// caller to terminate.
    pub async fn probe_session(&self, session_id: &str) -> Result<bool> {
        let session = self.get(session_id)?;
        let (alive, status) = self.monitor.liveness(&session).await?;
        if !alive && !session.exit_requested.load(Ordering::SeqCst) {
            self.monitor.reap(session_id, status).await;
        }
        Ok(alive)
    }

    /// Fold a finished task into the session's accumulators
    pub fn record_task(&self, session_id: &str, task: TaskRecord) -> Result<()> {
        let session = self.get(session_id)?;
        let mut record = session.record();
        let perf = &mut record.performance;
        if task.success {
            perf.tasks_completed += 1;
            let n = perf.tasks_completed as f64;
            perf.average_task_ms += (task.duration.as_millis() as f64 - perf.average_task_ms) / n;
        } else {
            perf.error_count += 1;
        }
        if task.tokens > 0 || task.cost > 0.0 {
            record.tokens.total_tokens += task.tokens;
            record.tokens.total_cost += task.cost.max(0.0);
            record.tokens.last_updated = Some(Utc::now());
        }
        Ok(())
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions().get(session_id).map(|s| s.info())
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.get(session_id)?.record().history.clone())
    }

    /// List all sessions
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions().values().map(|s| s.info()).collect()
    }

    /// List sessions for a specific agent
    pub fn list_by_agent(&self, agent_id: &str) -> Vec<SessionInfo> {
        self.sessions()
            .values()
            .filter(|s| s.agent_id == agent_id)
            .map(|s| s.info())
            .collect()
    }

    /// Number of active sessions
    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Terminate every session
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ManagedSession>> =
            self.sessions_mut().drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.teardown(session, TerminationReason::Requested).await;
        }
    }

    async fn teardown(&self, session: Arc<ManagedSession>, reason: TerminationReason) {
        self.monitor.teardown(session, reason).await;
    }

    async fn with_handle<T, F>(&self, session: &Arc<ManagedSession>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SessionHandle) -> Result<T> + Send + 'static,
    {
        self.monitor.with_handle(session, op).await
    }

    fn observe(&self, session: &ManagedSession) {
        if session.observe_output() {
            emit_idle_cleared(self.events(), session);
        }
    }

    fn emit_error(&self, session: &ManagedSession, error: &AtelierError) {
        self.monitor.emit_error(session, error);
    }

    fn get(&self, session_id: &str) -> Result<Arc<ManagedSession>> {
        self.sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))
    }

    fn sessions(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<ManagedSession>>> {
        self.monitor.sessions()
    }

    fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<ManagedSession>>> {
        self.monitor.sessions_mut()
    }
}

/// Strip terminal escapes and normalise line endings
fn clean_output(bytes: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(bytes);
    String::from_utf8_lossy(&stripped)
        .replace("\r\n", "\n")
        .replace('\r', "")
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
