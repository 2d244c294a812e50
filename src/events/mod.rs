//! EventBus - named broadcast channels for supervisor, lifecycle and
//! orchestrator notifications.
//!
//! Every channel is an independent `tokio::broadcast` channel, so delivery
//! order within a channel is the publish order. Slow subscribers miss events
//! (lagged) rather than blocking the publisher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default per-channel buffer size
const DEFAULT_CAPACITY: usize = 256;

/// Named event channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Process supervisor notifications
    Tmux,
    /// Agent lifecycle notifications
    Lifecycle,
    /// Orchestrator decisions
    Orchestrator,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Tmux, Channel::Lifecycle, Channel::Orchestrator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Tmux => "tmux",
            Channel::Lifecycle => "lifecycle",
            Channel::Orchestrator => "orchestrator",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event names. Each kind belongs to exactly one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.terminated")]
    SessionTerminated,
    #[serde(rename = "agent.message")]
    AgentMessage,
    #[serde(rename = "idle.detected")]
    IdleDetected,
    #[serde(rename = "idle.cleared")]
    IdleCleared,
    #[serde(rename = "resource.alert")]
    ResourceAlert,
    #[serde(rename = "error")]
    Error,

    #[serde(rename = "agent_registered")]
    AgentRegistered,
    #[serde(rename = "agent_spawning")]
    AgentSpawning,
    #[serde(rename = "agent_spawned")]
    AgentSpawned,
    #[serde(rename = "task_completed")]
    TaskCompleted,
    #[serde(rename = "task_failed")]
    TaskFailed,
    #[serde(rename = "agent_stopping")]
    AgentStopping,
    #[serde(rename = "agent_stopped")]
    AgentStopped,
    #[serde(rename = "agent_removed")]
    AgentRemoved,
    #[serde(rename = "agent_error")]
    AgentError,
    #[serde(rename = "agent_health_failed")]
    AgentHealthFailed,
    #[serde(rename = "token_alert")]
    TokenAlert,

    #[serde(rename = "decision.made")]
    DecisionMade,
    #[serde(rename = "context.compressed")]
    ContextCompressed,
    #[serde(rename = "delegation.failed")]
    DelegationFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session.created",
            EventKind::SessionTerminated => "session.terminated",
            EventKind::AgentMessage => "agent.message",
            EventKind::IdleDetected => "idle.detected",
            EventKind::IdleCleared => "idle.cleared",
            EventKind::ResourceAlert => "resource.alert",
            EventKind::Error => "error",
            EventKind::AgentRegistered => "agent_registered",
            EventKind::AgentSpawning => "agent_spawning",
            EventKind::AgentSpawned => "agent_spawned",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::AgentStopping => "agent_stopping",
            EventKind::AgentStopped => "agent_stopped",
            EventKind::AgentRemoved => "agent_removed",
            EventKind::AgentError => "agent_error",
            EventKind::AgentHealthFailed => "agent_health_failed",
            EventKind::TokenAlert => "token_alert",
            EventKind::DecisionMade => "decision.made",
            EventKind::ContextCompressed => "context.compressed",
            EventKind::DelegationFailed => "delegation.failed",
        }
    }

    /// The channel this kind is published on
    pub fn channel(&self) -> Channel {
        match self {
            EventKind::SessionCreated
            | EventKind::SessionTerminated
            | EventKind::AgentMessage
            | EventKind::IdleDetected
            | EventKind::IdleCleared
            | EventKind::ResourceAlert
            | EventKind::Error => Channel::Tmux,
            EventKind::AgentRegistered
            | EventKind::AgentSpawning
            | EventKind::AgentSpawned
            | EventKind::TaskCompleted
            | EventKind::TaskFailed
            | EventKind::AgentStopping
            | EventKind::AgentStopped
            | EventKind::AgentRemoved
            | EventKind::AgentError
            | EventKind::AgentHealthFailed
            | EventKind::TokenAlert => Channel::Lifecycle,
            EventKind::DecisionMade
            | EventKind::ContextCompressed
            | EventKind::DelegationFailed => Channel::Orchestrator,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single notification on the bus
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event
    pub source: String,
    pub data: Value,
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            source: source.into(),
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn channel(&self) -> Channel {
        self.kind.channel()
    }

    /// Convenience accessor for string fields in `data`
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Broadcast-based event bus with one channel per [`Channel`].
#[derive(Debug, Clone)]
pub struct EventBus {
    senders: Arc<HashMap<Channel, broadcast::Sender<Event>>>,
}

impl EventBus {
    /// Create a bus whose channels each retain `capacity` events per slow
    /// subscriber. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let senders = Channel::ALL
            .iter()
            .map(|channel| (*channel, broadcast::channel(capacity).0))
            .collect();
        Self {
            senders: Arc::new(senders),
        }
    }

    /// Subscribe to every future event on a channel.
    #[must_use]
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Event> {
        self.sender(channel).subscribe()
    }

    /// Publish an event on its channel.
    ///
    /// Returns the number of subscribers that received it. With no
    /// subscribers the event is dropped.
    pub fn publish(&self, event: Event) -> usize {
        tracing::trace!(channel = %event.channel(), kind = %event.kind, "publish");
        self.sender(event.channel()).send(event).unwrap_or(0)
    }

    pub fn emit(&self, kind: EventKind, source: &str, data: Value) -> usize {
        self.publish(Event::new(kind, source, data))
    }

    /// Register a handler for one event name.
    ///
    /// The handler runs on its own task, in channel order, until the bus is
    /// dropped or the returned handle is aborted.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> JoinHandle<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe(kind.channel());
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind == kind => handler(&event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(kind = %kind, missed, "Event handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Event> {
        // Every channel is inserted in `new`
        &self.senders[&channel]
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = EventBus::new(16);
        let mut tmux = bus.subscribe(Channel::Tmux);
        let mut lifecycle = bus.subscribe(Channel::Lifecycle);

        bus.emit(EventKind::AgentRegistered, "lifecycle", json!({"agent_id": "dev-1"}));

        let event = lifecycle.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::AgentRegistered);
        assert_eq!(event.data_str("agent_id"), Some("dev-1"));
        assert!(tmux.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_ordering() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe(Channel::Lifecycle);

        bus.emit(EventKind::AgentSpawning, "lifecycle", json!({}));
        bus.emit(EventKind::AgentSpawned, "lifecycle", json!({}));
        bus.emit(EventKind::AgentStopping, "lifecycle", json!({}));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::AgentSpawning);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::AgentSpawned);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::AgentStopping);
    }

    #[tokio::test]
    async fn test_zero_capacity_still_delivers() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe(Channel::Orchestrator);
        assert_eq!(bus.emit(EventKind::DecisionMade, "orchestrator", json!({})), 1);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::DecisionMade);
    }

    #[test]
    fn test_publish_no_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(EventKind::Error, "tmux", json!({})), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            EventKind::SessionTerminated,
            "supervisor",
            json!({"reason": "error"}),
        )
        .with_metadata("attempt", json!(1));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"session.terminated\""));
        assert!(json.contains("\"source\":\"supervisor\""));
        assert!(json.contains("\"attempt\":1"));
    }

    #[tokio::test]
    async fn test_typed_handler_filters_by_kind() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus.on(EventKind::IdleDetected, move |event| {
            sink.lock().unwrap().push(event.data_str("session_id").map(String::from));
        });
        tokio::task::yield_now().await;

        bus.emit(EventKind::SessionCreated, "supervisor", json!({"session_id": "a"}));
        bus.emit(EventKind::IdleDetected, "supervisor", json!({"session_id": "b"}));

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        handle.abort();
        assert_eq!(*seen.lock().unwrap(), vec![Some("b".to_string())]);
    }

    #[test]
    fn test_kinds_map_to_channels() {
        assert_eq!(EventKind::ResourceAlert.channel(), Channel::Tmux);
        assert_eq!(EventKind::TaskCompleted.channel(), Channel::Lifecycle);
        assert_eq!(EventKind::DecisionMade.channel(), Channel::Orchestrator);
    }
}
