mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use atelier::agent::{AgentState, AgentType};
use atelier::config::{CoordinationConfig, OrchestratorConfig};
use atelier::events::{Channel, EventKind};
use atelier::orchestrator::{Action, Orchestrator, Signal};
use common::{drain, wait_for, Harness};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        coordination: CoordinationConfig {
            retry_delay_ms: 10,
            max_retry_delay_ms: 50,
            default_timeout_ms: 5_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn orchestrator(h: &Harness, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(h.manager.clone(), config).unwrap()
}

fn mentions(steps: &[atelier::orchestrator::ReasoningStep], needle: &str) -> bool {
    steps.iter().any(|s| s.thought.contains(needle))
}

#[tokio::test]
async fn blocker_is_delegated_to_running_developer() {
    let h = Harness::new();
    h.running("dev-1", AgentType::Developer, 5).await;
    let mut rx = h.events.subscribe(Channel::Orchestrator);
    let orch = orchestrator(&h, config());

    let outcome = orch
        .handle_signal(Signal::new("[BLOCKER]", "src/db.rs:42", "migration deadlocks"))
        .await
        .unwrap();

    let decision = &outcome.decision;
    assert_eq!(decision.action, Action::Delegate);
    assert_eq!(decision.target_agent.as_deref(), Some("dev-1"));
    assert_eq!(decision.signal, "BLOCKER");
    assert!(decision.confidence >= orch.config().thresholds.min_confidence);
    assert!(!decision.reasoning.is_empty());
    assert!(decision.reasoning.len() <= orch.config().max_chain_of_thought_depth);
    assert!(decision.tools.contains(&"lifecycle.execute_task:dev-1".to_string()));
    assert!(outcome.task.as_ref().is_some_and(|t| t.success));

    let event = wait_for(&mut rx, EventKind::DecisionMade).await;
    assert_eq!(event.data["action"], "delegate");
    assert_eq!(event.data["target_agent"], "dev-1");

    let records = h.accountant.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].operation, "task:blocker");
}

#[tokio::test]
async fn informational_signals_are_not_delegated() {
    let h = Harness::new();
    h.running("dev-1", AgentType::Developer, 5).await;
    let orch = orchestrator(&h, config());

    let progress = orch
        .handle_signal(Signal::new("[PROGRESS]", "README.md", "docs half done"))
        .await
        .unwrap();
    assert_eq!(progress.decision.action, Action::Archive);
    assert!(progress.task.is_none());
    assert!(progress.decision.tools.is_empty());

    let question = orch
        .handle_signal(Signal::new("[QUESTION]", "src/api.rs", "v1 or v2?"))
        .await
        .unwrap();
    assert_eq!(question.decision.action, Action::RequestGuidance);

    let security = orch
        .handle_signal(Signal::new("[SECURITY]", "src/auth.rs", "token logged"))
        .await
        .unwrap();
    assert_eq!(security.decision.action, Action::Escalate);
    assert!(security.decision.target_agent.is_none());

    assert!(h.accountant.records().is_empty());
    assert_eq!(orch.recent_signals().len(), 3);
}

#[tokio::test]
async fn low_confidence_escalates() {
    let h = Harness::new();
    h.running("dev-1", AgentType::Developer, 5).await;
    let mut config = config();
    config.thresholds.min_confidence = 0.9;
    let orch = orchestrator(&h, config);

    let outcome = orch
        .handle_signal(Signal::new("[BUG]", "src/lib.rs", "off by one"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Escalate);
    assert!(mentions(&outcome.decision.reasoning, "below threshold"));
    assert!(h.accountant.records().is_empty());
}

#[tokio::test]
async fn token_budget_escalates() {
    let h = Harness::new();
    h.running("dev-1", AgentType::Developer, 5).await;
    let mut config = config();
    config.thresholds.max_tokens_per_decision = 5;
    let orch = orchestrator(&h, config);

    let outcome = orch
        .handle_signal(Signal::new("[BUG]", "src/lib.rs", "panics on empty input"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Escalate);
    assert!(mentions(&outcome.decision.reasoning, "decision budget"));
}

#[tokio::test]
async fn reasoning_depth_is_bounded() {
    let h = Harness::new();
    h.running("dev-1", AgentType::Developer, 5).await;
    let mut config = config();
    config.max_chain_of_thought_depth = 1;
    let orch = orchestrator(&h, config);

    let outcome = orch
        .handle_signal(Signal::new("[BUG]", "src/lib.rs", "off by one"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Escalate);
    assert_eq!(outcome.decision.reasoning.len(), 1);
    assert!(h.accountant.records().is_empty());
}

#[tokio::test]
async fn metadata_picks_the_role() {
    let h = Harness::new();
    h.running("dev-1", AgentType::Developer, 9).await;
    h.running("qa-1", AgentType::Qa, 1).await;
    let orch = orchestrator(&h, config());

    let signal = Signal::new("[BUG]", "tests/api.rs", "flaky assertion")
        .with_metadata("agent_type", json!("qa"));
    let outcome = orch.handle_signal(signal).await.unwrap();
    assert_eq!(outcome.decision.target_agent.as_deref(), Some("qa-1"));
}

#[tokio::test]
async fn stopped_agent_is_spawned_on_demand() {
    let h = Harness::new();
    h.manager
        .register_agent(h.agent("dev-1", AgentType::Developer, 5))
        .unwrap();
    let orch = orchestrator(&h, config());

    let outcome = orch
        .handle_signal(Signal::new("[TODO]", "src/main.rs:7", "wire up config"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Delegate);
    assert_eq!(outcome.decision.target_agent.as_deref(), Some("dev-1"));
    assert!(outcome
        .decision
        .tools
        .contains(&"lifecycle.spawn_agent:dev-1".to_string()));
    assert_eq!(
        h.manager.get_agent_status("dev-1").unwrap().state,
        AgentState::Running
    );
}

#[tokio::test]
async fn spawn_on_demand_respects_capacity() {
    let h = Harness::new();
    h.running("qa-1", AgentType::Qa, 5).await;
    h.manager
        .register_agent(h.agent("dev-1", AgentType::Developer, 5))
        .unwrap();
    let mut config = config();
    config.coordination.max_active_agents = 1;
    let orch = orchestrator(&h, config);

    let outcome = orch
        .handle_signal(Signal::new("[BUG]", "src/lib.rs", "wrong total"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Escalate);
    assert_eq!(h.backend.launch_count(), 1);
    assert_eq!(
        h.manager.get_agent_status("dev-1").unwrap().state,
        AgentState::Stopped
    );
}

#[tokio::test]
async fn failed_delegation_retries_on_another_agent() {
    let h = Harness::new();
    h.running("dev-a", AgentType::Developer, 8).await;
    h.running("dev-b", AgentType::Developer, 3).await;
    let mut rx = h.events.subscribe(Channel::Orchestrator);
    let orch = orchestrator(&h, config());

    // dev-a's process dies without the lifecycle manager noticing
    let session = h.manager.get_agent_status("dev-a").unwrap().session_id.unwrap();
    h.backend.crash(&session);

    let outcome = orch
        .handle_signal(Signal::new("[BUG]", "src/lib.rs", "wrong total"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Delegate);
    assert_eq!(outcome.decision.target_agent.as_deref(), Some("dev-b"));

    let failed = wait_for(&mut rx, EventKind::DelegationFailed).await;
    assert_eq!(failed.data_str("agent_id"), Some("dev-a"));
    assert_eq!(failed.data["will_retry"], true);
    assert!(orch.error_rate() > 0.0);
}

#[tokio::test]
async fn exhausted_retries_escalate() {
    let h = Harness::new();
    h.backend.fail_tasks_of_type("bug");
    h.running("dev-a", AgentType::Developer, 5).await;
    h.running("dev-b", AgentType::Developer, 5).await;
    let mut rx = h.events.subscribe(Channel::Orchestrator);
    let orch = orchestrator(&h, config());

    let outcome = orch
        .handle_signal(Signal::new("[BUG]", "src/lib.rs", "wrong total"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Escalate);
    assert!(outcome.task.is_none());

    let failures: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == EventKind::DelegationFailed)
        .collect();
    assert_eq!(failures.len(), 2);
    assert_ne!(failures[0].data["agent_id"], failures[1].data["agent_id"]);
    assert_eq!(failures[1].data["will_retry"], false);
    assert_eq!(orch.error_rate(), 1.0);
}

#[tokio::test]
async fn high_error_rate_stops_delegation() {
    let h = Harness::new();
    h.backend.fail_tasks_of_type("bug");
    h.running("dev-a", AgentType::Developer, 5).await;
    h.running("dev-b", AgentType::Developer, 5).await;
    let orch = orchestrator(&h, config());

    for _ in 0..2 {
        orch.handle_signal(Signal::new("[BUG]", "src/lib.rs", "wrong total"))
            .await
            .unwrap();
    }
    let attempts = h.accountant.records().len();

    let outcome = orch
        .handle_signal(Signal::new("[BLOCKER]", "src/db.rs", "stuck"))
        .await
        .unwrap();
    assert_eq!(outcome.decision.action, Action::Escalate);
    assert!(mentions(&outcome.decision.reasoning, "error rate"));
    assert_eq!(h.accountant.records().len(), attempts);
}

#[tokio::test]
async fn round_robin_spreads_work() {
    let h = Harness::new();
    h.running("dev-a", AgentType::Developer, 5).await;
    h.running("dev-b", AgentType::Developer, 5).await;
    let orch = orchestrator(&h, config());

    let mut targets = Vec::new();
    for i in 0..3 {
        let outcome = orch
            .handle_signal(Signal::new("[BUG]", format!("src/m{}.rs", i), "fix"))
            .await
            .unwrap();
        targets.push(outcome.decision.target_agent.unwrap());
    }
    assert_eq!(targets, ["dev-a", "dev-b", "dev-a"]);
}

#[tokio::test]
async fn oversized_context_is_compressed() {
    let h = Harness::new();
    let mut rx = h.events.subscribe(Channel::Orchestrator);
    let mut config = config();
    config.max_context_size = 60;
    let orch = orchestrator(&h, config);

    let content = "x".repeat(100);
    let mut last = None;
    for _ in 0..3 {
        last = Some(
            orch.handle_signal(Signal::new("[PROGRESS]", "src/lib.rs", content.as_str()))
                .await
                .unwrap(),
        );
    }
    let decision = last.unwrap().decision;
    assert!(decision.tools.contains(&"context.compress".to_string()));
    assert!(decision.context_tokens <= 48);

    let event = wait_for(&mut rx, EventKind::ContextCompressed).await;
    assert!(event.data["compressed_tokens"].as_u64().unwrap() <= 48);
    let record = orch.last_compression().unwrap();
    assert!(record.preserved_categories.contains(&"signal".to_string()));
    assert!(record.dropped_categories.contains(&"signals".to_string()));
}

#[tokio::test]
async fn concurrent_decisions_are_bounded() {
    let h = Harness::new();
    h.backend.set_response_delay(Duration::from_millis(200));
    h.running("dev-a", AgentType::Developer, 5).await;
    h.running("dev-b", AgentType::Developer, 5).await;
    let mut config = config();
    config.max_concurrent_decisions = 1;
    let orch = Arc::new(orchestrator(&h, config));

    let started = Instant::now();
    let (a, b) = tokio::join!(
        orch.handle_signal(Signal::new("[BUG]", "src/a.rs", "one")),
        orch.handle_signal(Signal::new("[BUG]", "src/b.rs", "two")),
    );
    assert!(a.unwrap().task.is_some());
    assert!(b.unwrap().task.is_some());
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(orch.in_flight(), 0);
}

#[tokio::test]
async fn run_consumes_signal_stream() {
    let h = Harness::new();
    let mut rx = h.events.subscribe(Channel::Orchestrator);
    let orch = Arc::new(orchestrator(&h, config()));
    let (tx, signals) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(orch.clone().run(signals, cancel.clone()));

    for code in ["[PROGRESS]", "[COMPLETION]", "[QUESTION]"] {
        tx.send(Signal::new(code, "notes.md", "update")).await.unwrap();
    }
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();

    let decisions = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == EventKind::DecisionMade)
        .count();
    assert_eq!(decisions, 3);
}

#[tokio::test]
async fn run_stops_on_cancel() {
    let h = Harness::new();
    let orch = Arc::new(orchestrator(&h, config()));
    let (_tx, signals) = mpsc::channel::<Signal>(8);
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(orch.run(signals, cancel.clone()));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    let h = Harness::new();
    let mut config = config();
    config.max_concurrent_decisions = 0;
    let err = Orchestrator::new(h.manager.clone(), config).err().unwrap();
    assert!(err.is_configuration());
}
