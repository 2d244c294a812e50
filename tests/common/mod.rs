#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use atelier::agent::{AgentConfig, AgentLifecycleManager, AgentType, HealthCheckPolicy};
use atelier::config::SupervisorConfig;
use atelier::events::{Event, EventBus, EventKind};
use atelier::supervisor::ProcessSupervisor;
use atelier::testing::{
    fast_supervisor_config, RecordingAccountant, ScriptedBackend, StaticInspector,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<ScriptedBackend>,
    pub inspector: Arc<StaticInspector>,
    pub accountant: Arc<RecordingAccountant>,
    pub events: EventBus,
    pub supervisor: Arc<ProcessSupervisor>,
    pub manager: Arc<AgentLifecycleManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut SupervisorConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = fast_supervisor_config(dir.path());
        tweak(&mut config);

        let backend = Arc::new(ScriptedBackend::new());
        backend.set_response_delay(Duration::from_millis(10));
        let inspector = Arc::new(StaticInspector::default());
        let accountant = Arc::new(RecordingAccountant::new(0.001));
        let events = EventBus::default();
        let supervisor = Arc::new(
            ProcessSupervisor::new(backend.clone(), inspector.clone(), events.clone(), config)
                .unwrap(),
        );
        let manager = AgentLifecycleManager::new(supervisor.clone(), accountant.clone());

        Self {
            dir,
            backend,
            inspector,
            accountant,
            events,
            supervisor,
            manager,
        }
    }

    /// Agent config rooted in the temp dir, health checks off
    pub fn agent(&self, id: &str, agent_type: AgentType, priority: i32) -> AgentConfig {
        let mut config = AgentConfig::new(id, agent_type).with_priority(priority);
        config.working_directory = Some(self.dir.path().to_path_buf());
        config.health_check = HealthCheckPolicy::disabled();
        config
    }

    pub async fn running(&self, id: &str, agent_type: AgentType, priority: i32) {
        self.manager
            .register_agent(self.agent(id, agent_type, priority))
            .unwrap();
        self.manager.spawn_agent(id).await.unwrap();
    }
}

/// Next event of `kind`, skipping everything else
pub async fn wait_for(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind == kind => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

/// Everything already queued on the receiver
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// Poll `check` until it holds or the wait runs out
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
