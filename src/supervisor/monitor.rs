//! Per-session monitoring loops
//!
//! Two independent loops per session: resource sampling with a liveness
//! probe, and idle detection. Both stop as soon as the session's cancellation
//! token fires, which the supervisor does before it releases the backing
//! process.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::backend::{ProcessStatus, SessionHandle, SessionId};
use super::inspector::ProcessInspector;
use super::session::{ManagedSession, SessionState, TerminationReason};
use crate::config::SupervisorConfig;
use crate::events::{EventBus, EventKind};
use crate::{AtelierError, Result};

pub(crate) const SOURCE: &str = "supervisor";

/// State shared by the supervisor and every monitor it starts
pub(crate) struct MonitorContext {
    pub inspector: Arc<dyn ProcessInspector>,
    pub events: EventBus,
    pub config: SupervisorConfig,
    /// Active sessions indexed by session ID
    pub sessions: RwLock<HashMap<SessionId, Arc<ManagedSession>>>,
}

impl MonitorContext {
    pub fn sessions(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<ManagedSession>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<ManagedSession>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a blocking handle operation off the runtime, bounded by the I/O timeout
    pub async fn with_handle<T, F>(&self, session: &Arc<ManagedSession>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SessionHandle) -> Result<T> + Send + 'static,
    {
        let session = session.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut handle = session.handle();
            op(&mut **handle)
        });
        match tokio::time::timeout(self.config.io_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(AtelierError::Session(format!("session I/O task failed: {}", e))),
            Err(_) => Err(AtelierError::Session(format!(
                "session I/O timed out after {}ms",
                self.config.io_timeout_ms
            ))),
        }
    }

    /// Whether the backing process still exists, with the status it reported
    pub async fn liveness(&self, session: &Arc<ManagedSession>) -> Result<(bool, ProcessStatus)> {
        let status = self.with_handle(session, |h| Ok(h.poll())).await?;
        let alive = status.is_running()
            && session
                .pid
                .is_none_or(|pid| self.inspector.is_alive(pid));
        Ok((alive, status))
    }

    /// Tear down a session whose process vanished.
    ///
    /// Only the first caller for a session does anything; returns whether
    /// this call removed it.
    pub async fn reap(&self, session_id: &str, status: ProcessStatus) -> bool {
        let removed = self.sessions_mut().remove(session_id);
        let Some(session) = removed else {
            return false;
        };
        tracing::error!(
            session_id = %session_id,
            agent_id = %session.agent_id,
            ?status,
            "Session process exited unexpectedly"
        );
        self.emit_error(
            &session,
            &AtelierError::Session(format!("process exited unexpectedly: {:?}", status)),
        );
        self.teardown(session, TerminationReason::Error).await;
        true
    }

    pub async fn teardown(&self, session: Arc<ManagedSession>, reason: TerminationReason) {
        // Monitors go first so nothing samples a process that is being destroyed
        session.cancel.cancel();
        let monitors: Vec<_> = std::mem::take(
            &mut *session.monitors.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for monitor in monitors {
            let abort = monitor.abort_handle();
            if tokio::time::timeout(self.config.io_timeout(), monitor)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        if let Err(e) = self.with_handle(&session, |h| h.kill()).await {
            tracing::warn!(session_id = %session.id, "Kill failed: {}", e);
        }

        {
            let mut record = session.record();
            record.state = match reason {
                TerminationReason::Error | TerminationReason::HealthCheckFailed => {
                    SessionState::Error
                }
                TerminationReason::Requested | TerminationReason::Graceful => SessionState::Stopped,
            };
            record.ended_at = Some(Utc::now());
        }

        tracing::info!(
            session_id = %session.id,
            agent_id = %session.agent_id,
            reason = reason.as_str(),
            "Session terminated"
        );
        self.events.emit(
            EventKind::SessionTerminated,
            SOURCE,
            json!({
                "session_id": session.id,
                "agent_id": session.agent_id,
                "reason": reason.as_str(),
            }),
        );
    }

    pub fn emit_error(&self, session: &ManagedSession, error: &AtelierError) {
        self.events.emit(
            EventKind::Error,
            SOURCE,
            json!({
                "session_id": session.id,
                "agent_id": session.agent_id,
                "kind": error.kind(),
                "error": error.to_string(),
            }),
        );
    }
}

pub(crate) fn emit_idle_cleared(events: &EventBus, session: &ManagedSession) {
    tracing::debug!(session_id = %session.id, "Session active again");
    events.emit(
        EventKind::IdleCleared,
        SOURCE,
        json!({ "session_id": session.id, "agent_id": session.agent_id }),
    );
}

/// Probe and sample the backing process on a fixed interval.
///
/// A process that is gone gets its session reaped with reason `error`.
/// Threshold breaches are advisory: an alert is emitted, the session keeps running.
pub(crate) fn spawn_resource_monitor(
    session: Arc<ManagedSession>,
    ctx: Arc<MonitorContext>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.resource_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match ctx.liveness(&session).await {
                Ok((true, _)) => {}
                Ok((false, _)) if session.exit_requested.load(Ordering::SeqCst) => continue,
                Ok((false, status)) => {
                    // Teardown waits on this monitor, so it runs on its own task
                    let reaper = ctx.clone();
                    let session_id = session.id.clone();
                    tokio::spawn(async move {
                        reaper.reap(&session_id, status).await;
                    });
                    break;
                }
                Err(e) => {
                    tracing::debug!(session_id = %session.id, "Liveness probe failed: {}", e);
                    continue;
                }
            }

            let Some(pid) = session.pid else {
                continue;
            };
            let sample =
                match tokio::time::timeout(ctx.config.io_timeout(), ctx.inspector.sample(pid)).await
                {
                    Ok(Ok(Some(sample))) => sample,
                    Ok(Ok(None)) => {
                        tracing::debug!(session_id = %session.id, pid, "Process not found while sampling");
                        continue;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(session_id = %session.id, "Resource sample failed: {}", e);
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(session_id = %session.id, "Resource sample timed out");
                        continue;
                    }
                };
            session.record().resources.record(sample);

            let memory_high = sample.memory_bytes > ctx.config.memory_alert_bytes;
            let cpu_high = sample.cpu_percent > ctx.config.cpu_alert_percent;
            if memory_high || cpu_high {
                tracing::warn!(
                    session_id = %session.id,
                    agent_id = %session.agent_id,
                    memory_bytes = sample.memory_bytes,
                    cpu_percent = sample.cpu_percent,
                    "Resource threshold exceeded"
                );
                ctx.events.emit(
                    EventKind::ResourceAlert,
                    SOURCE,
                    json!({
                        "session_id": session.id,
                        "agent_id": session.agent_id,
                        "memory_bytes": sample.memory_bytes,
                        "cpu_percent": sample.cpu_percent,
                        "memory_threshold_bytes": ctx.config.memory_alert_bytes,
                        "cpu_threshold_percent": ctx.config.cpu_alert_percent,
                        "memory_exceeded": memory_high,
                        "cpu_exceeded": cpu_high,
                    }),
                );
            }
        }
    })
}

/// Reclassify a running session as idle once nothing happened for the idle timeout.
///
/// Runs at half the timeout. New output counts as activity and wakes an idle
/// session back up.
pub(crate) fn spawn_idle_monitor(
    session: Arc<ManagedSession>,
    ctx: Arc<MonitorContext>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timeout = ctx.config.idle_timeout();
        let mut ticker = tokio::time::interval(ctx.config.idle_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if session.observe_output() {
                emit_idle_cleared(&ctx.events, &session);
                continue;
            }

            let idle_for = {
                let mut record = session.record();
                let idle_for = record.idle_for();
                if record.state == SessionState::Running && idle_for >= timeout {
                    record.state = SessionState::Idle;
                    Some(idle_for)
                } else {
                    None
                }
            };

            if let Some(idle_for) = idle_for {
                tracing::info!(
                    session_id = %session.id,
                    agent_id = %session.agent_id,
                    idle_ms = idle_for.as_millis() as u64,
                    "Session idle"
                );
                ctx.events.emit(
                    EventKind::IdleDetected,
                    SOURCE,
                    json!({
                        "session_id": session.id,
                        "agent_id": session.agent_id,
                        "idle_ms": idle_for.as_millis() as u64,
                    }),
                );
            }
        }
    })
}
