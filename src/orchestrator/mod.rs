//! Orchestrator decision core
//!
//! Turns scanner signals into [`Decision`]s under hard bounds: reasoning
//! depth, concurrent decisions, context size, confidence, token budget,
//! processing time and the recent delegation error rate. Delegated work goes
//! through the [`AgentLifecycleManager`]; the orchestrator never touches a
//! session directly.

pub mod balancer;
pub mod context;
pub mod decision;
pub mod signal;

pub use balancer::{backoff_delay, LoadBalancer};
pub use context::{CompressionRecord, ContextSegment, DecisionContext};
pub use decision::{Action, Decision, ReasoningChain, ReasoningStep};
pub use signal::{rule_for, Signal, SignalCategory, SignalRule, SignalType};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentLifecycleManager, AgentStatus, AgentType, Task, TaskOptions, TaskResult};
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, EventKind};
use crate::{AtelierError, Result};
use context::{CATEGORY_ACTIVE_TASKS, CATEGORY_AGENT_STATUS, CATEGORY_SIGNAL, CATEGORY_SIGNALS};

const SOURCE: &str = "orchestrator";

/// The error rate is not trusted below this many outcomes
const MIN_ERROR_SAMPLES: usize = 3;

/// A decision plus the task result when work was delegated
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub task: Option<TaskResult>,
}

struct DelegationOutcome {
    at: Instant,
    failed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Orchestrator {
    lifecycle: Arc<AgentLifecycleManager>,
    config: OrchestratorConfig,
    events: EventBus,
    /// One permit per decision cycle in flight
    permits: Semaphore,
    balancer: LoadBalancer,
    history: Mutex<VecDeque<Signal>>,
    outcomes: Mutex<VecDeque<DelegationOutcome>>,
    last_compression: Mutex<Option<CompressionRecord>>,
    /// Spawn-on-demand must not overshoot `max_active_agents`
    spawn_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(lifecycle: Arc<AgentLifecycleManager>, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            events: lifecycle.events().clone(),
            permits: Semaphore::new(config.max_concurrent_decisions),
            balancer: LoadBalancer::new(config.coordination.load_balancing),
            lifecycle,
            history: Mutex::new(VecDeque::new()),
            outcomes: Mutex::new(VecDeque::new()),
            last_compression: Mutex::new(None),
            spawn_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Decision cycles currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_decisions - self.permits.available_permits()
    }

    /// Failed share of recent delegations
    pub fn error_rate(&self) -> f64 {
        let mut outcomes = lock(&self.outcomes);
        self.prune(&mut outcomes);
        if outcomes.is_empty() {
            return 0.0;
        }
        let failed = outcomes.iter().filter(|o| o.failed).count();
        failed as f64 / outcomes.len() as f64
    }

    pub fn recent_signals(&self) -> Vec<Signal> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn last_compression(&self) -> Option<CompressionRecord> {
        lock(&self.last_compression).clone()
    }

    /// Run one decision cycle for `signal`.
    ///
    /// Waits for a free decision slot first. Anything that prevents a safe
    /// delegation turns the decision into an escalation.
    pub async fn handle_signal(&self, signal: Signal) -> Result<DecisionOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AtelierError::Orchestrator("decision limiter closed".to_string()))?;
        let started = Instant::now();

        let rule = signal.rule();
        let role = signal.role(&rule);
        let mut chain = ReasoningChain::new(self.config.max_chain_of_thought_depth);
        let mut tools = Vec::new();

        chain.step(format!(
            "{} from {} is {:?} (urgency {:.2}); table suggests {} at confidence {:.2}",
            signal.signal_type,
            signal.source,
            rule.category,
            rule.urgency,
            rule.action,
            rule.confidence
        ));

        let mut context = self.build_context(&signal);
        if let Some(record) =
            context.compress(self.config.max_context_size, self.config.context_target_ratio)
        {
            tools.push("context.compress".to_string());
            chain.step(format!(
                "context compressed from {} to {} tokens",
                record.original_tokens, record.compressed_tokens
            ));
            tracing::debug!(
                original = record.original_tokens,
                compressed = record.compressed_tokens,
                "Decision context compressed"
            );
            self.emit(
                EventKind::ContextCompressed,
                json!({
                    "signal": signal.signal_type,
                    "original_tokens": record.original_tokens,
                    "compressed_tokens": record.compressed_tokens,
                    "preserved_categories": record.preserved_categories,
                    "dropped_categories": record.dropped_categories,
                }),
            );
            *lock(&self.last_compression) = Some(record);
        }
        let context_tokens = context.total_tokens();
        self.remember(signal.clone());

        let mut action = rule.action;
        let mut target = None;
        let mut task = None;

        if action == Action::Delegate {
            match self.delegation_blocker(&rule, context_tokens, started) {
                Some(reason) => {
                    chain.step(reason);
                    action = Action::Escalate;
                }
                None => {
                    let role_name = role
                        .as_ref()
                        .map(AgentType::to_string)
                        .unwrap_or_else(|| "any".to_string());
                    let candidates = if chain.step(format!("delegating to a {} agent", role_name)) {
                        self.candidates(role.as_ref(), &role_name, &mut tools).await
                    } else {
                        tracing::debug!(signal = %signal.signal_type, "Reasoning depth exhausted");
                        Vec::new()
                    };
                    if chain.is_truncated() {
                        action = Action::Escalate;
                    } else if candidates.is_empty() {
                        chain.step("no eligible agent and no capacity to spawn one");
                        action = Action::Escalate;
                    } else {
                        match self
                            .delegate(&signal, &rule, candidates, &mut chain, &mut tools)
                            .await
                        {
                            Some((agent_id, result)) => {
                                target = Some(agent_id);
                                task = Some(result);
                            }
                            None => action = Action::Escalate,
                        }
                    }
                }
            }
        }

        chain.conclude(match &target {
            Some(agent_id) => format!("decision: {} to {}", action, agent_id),
            None => format!("decision: {}", action),
        });

        let decision = Decision {
            id: Uuid::new_v4(),
            signal: signal.signal_type.code().to_string(),
            target_agent: target,
            action,
            reasoning: chain.into_steps(),
            confidence: rule.confidence,
            tools,
            context_tokens,
            timestamp: Utc::now(),
        };

        tracing::info!(
            decision_id = %decision.id,
            signal = %signal.signal_type,
            action = %decision.action,
            agent = ?decision.target_agent,
            confidence = decision.confidence,
            "Decision made"
        );
        self.emit(EventKind::DecisionMade, serde_json::to_value(&decision)?);
        Ok(DecisionOutcome { decision, task })
    }

    /// Consume signals until the channel closes or `cancel` fires.
    ///
    /// Decisions run concurrently up to `max_concurrent_decisions`. On
    /// cancellation in-flight decisions are aborted; on channel close they
    /// are allowed to finish.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<Signal>, cancel: CancellationToken) {
        let mut decisions = JoinSet::new();
        tracing::info!(
            max_concurrent = self.config.max_concurrent_decisions,
            "Orchestrator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = signals.recv() => match received {
                    Some(signal) => {
                        let this = self.clone();
                        decisions.spawn(async move {
                            if let Err(e) = this.handle_signal(signal).await {
                                tracing::error!("Decision cycle failed: {}", e);
                            }
                        });
                    }
                    None => break,
                },
                Some(joined) = decisions.join_next(), if !decisions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Decision task ended abnormally: {}", e);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            decisions.abort_all();
        }
        while let Some(joined) = decisions.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::error!("Decision task ended abnormally: {}", e);
                }
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    /// Why a delegation must not go ahead, if anything
    fn delegation_blocker(
        &self,
        rule: &SignalRule,
        context_tokens: usize,
        started: Instant,
    ) -> Option<String> {
        let thresholds = &self.config.thresholds;
        if rule.confidence < thresholds.min_confidence {
            return Some(format!(
                "confidence {:.2} below threshold {:.2}",
                rule.confidence, thresholds.min_confidence
            ));
        }
        if context_tokens > thresholds.max_tokens_per_decision {
            return Some(format!(
                "context needs {} tokens, decision budget is {}",
                context_tokens, thresholds.max_tokens_per_decision
            ));
        }
        let error_rate = self.error_rate();
        let samples = lock(&self.outcomes).len();
        if samples >= MIN_ERROR_SAMPLES && error_rate > thresholds.max_error_rate {
            return Some(format!(
                "recent delegation error rate {:.2} above {:.2}",
                error_rate, thresholds.max_error_rate
            ));
        }
        if started.elapsed() > thresholds.max_processing() {
            return Some(format!(
                "decision exceeded {}ms processing budget",
                thresholds.max_processing_ms
            ));
        }
        None
    }

    /// Eligible agents in attempt order, spawning one if none is up
    async fn candidates(
        &self,
        role: Option<&AgentType>,
        role_name: &str,
        tools: &mut Vec<String>,
    ) -> Vec<AgentStatus> {
        let mut eligible = self.lifecycle.eligible_agents(role);
        if eligible.is_empty() {
            let _spawning = self.spawn_lock.lock().await;
            eligible = self.lifecycle.eligible_agents(role);
            let capacity = self.config.coordination.max_active_agents;
            if eligible.is_empty() && self.lifecycle.active_agent_count() < capacity {
                for candidate in self.lifecycle.spawn_candidates(role) {
                    tools.push(format!("lifecycle.spawn_agent:{}", candidate.id));
                    match self.lifecycle.spawn_agent(&candidate.id).await {
                        Ok(_) => {
                            tracing::info!(agent_id = %candidate.id, role = role_name, "Spawned agent on demand");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %candidate.id, "On-demand spawn failed: {}", e);
                        }
                    }
                }
                eligible = self.lifecycle.eligible_agents(role);
            }
        }
        self.balancer.order(role_name, eligible)
    }

    /// Try the task on successive agents until one completes it
    async fn delegate(
        &self,
        signal: &Signal,
        rule: &SignalRule,
        candidates: Vec<AgentStatus>,
        chain: &mut ReasoningChain,
        tools: &mut Vec<String>,
    ) -> Option<(String, TaskResult)> {
        let coordination = &self.config.coordination;
        let attempts = (coordination.retry_attempts as usize + 1).min(candidates.len());
        let task = task_for(signal, rule);

        for (attempt, agent) in candidates.iter().take(attempts).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(coordination, attempt as u32 - 1)).await;
            }
            tools.push(format!("lifecycle.execute_task:{}", agent.id));
            let options = TaskOptions {
                timeout: Some(coordination.default_timeout()),
                track_tokens: true,
            };

            let error = match self
                .lifecycle
                .execute_task(&agent.id, task.clone(), options)
                .await
            {
                Ok(result) if result.success => {
                    let slow = result.duration > self.config.thresholds.max_agent_response();
                    if slow {
                        tracing::warn!(
                            agent_id = %agent.id,
                            duration_ms = result.duration.as_millis() as u64,
                            "Agent response slower than threshold"
                        );
                    }
                    self.record_outcome(slow);
                    chain.step(format!(
                        "{} completed {} in {}ms",
                        agent.id,
                        task.id,
                        result.duration.as_millis()
                    ));
                    return Some((agent.id.clone(), result));
                }
                Ok(result) => AtelierError::TaskFailed {
                    agent_id: agent.id.clone(),
                    task_id: task.id.clone(),
                    message: if result.output.is_empty() {
                        "agent reported failure".to_string()
                    } else {
                        result.output
                    },
                },
                Err(e) => e,
            };

            self.record_outcome(true);
            let will_retry = attempt + 1 < attempts;
            chain.step(format!("attempt {} on {} failed: {}", attempt + 1, agent.id, error));
            tracing::warn!(agent_id = %agent.id, attempt = attempt + 1, will_retry, "Delegation failed: {}", error);
            self.emit(
                EventKind::DelegationFailed,
                json!({
                    "signal": signal.signal_type,
                    "task_id": task.id,
                    "agent_id": agent.id,
                    "attempt": attempt + 1,
                    "will_retry": will_retry,
                    "kind": error.kind(),
                    "error": error.to_string(),
                }),
            );
        }
        None
    }

    fn build_context(&self, signal: &Signal) -> DecisionContext {
        let mut context = DecisionContext::new();
        context.push(ContextSegment::new(
            CATEGORY_SIGNAL,
            10,
            format!("{} {}: {}", signal.signal_type, signal.source, signal.content),
        ));

        let agents = self.lifecycle.get_all_agents_status();
        let status: Vec<String> = agents
            .iter()
            .map(|a| {
                format!(
                    "{} {} {} priority={} errors={}",
                    a.id, a.agent_type, a.state, a.priority, a.error_count
                )
            })
            .collect();
        context.push(ContextSegment::new(CATEGORY_AGENT_STATUS, 8, status.join("\n")));

        let busy: Vec<String> = agents
            .iter()
            .filter(|a| a.active_tasks > 0)
            .map(|a| format!("{} running {} task(s)", a.id, a.active_tasks))
            .collect();
        if !busy.is_empty() {
            context.push(ContextSegment::new(CATEGORY_ACTIVE_TASKS, 6, busy.join("\n")));
        }

        for past in lock(&self.history).iter() {
            context.push(
                ContextSegment::new(
                    CATEGORY_SIGNALS,
                    4,
                    format!("{} {}: {}", past.signal_type, past.source, past.content),
                )
                .accessed_at(past.timestamp),
            );
        }
        context
    }

    fn remember(&self, signal: Signal) {
        let limit = self.config.signal_history;
        if limit == 0 {
            return;
        }
        let mut history = lock(&self.history);
        history.push_back(signal);
        while history.len() > limit {
            history.pop_front();
        }
    }

    fn record_outcome(&self, failed: bool) {
        let mut outcomes = lock(&self.outcomes);
        outcomes.push_back(DelegationOutcome {
            at: Instant::now(),
            failed,
        });
        self.prune(&mut outcomes);
    }

    fn prune(&self, outcomes: &mut VecDeque<DelegationOutcome>) {
        let thresholds = &self.config.thresholds;
        while outcomes.len() > thresholds.error_window {
            outcomes.pop_front();
        }
        let max_age = thresholds.error_window_age();
        while outcomes.front().is_some_and(|o| o.at.elapsed() > max_age) {
            outcomes.pop_front();
        }
    }

    fn emit(&self, kind: EventKind, data: Value) {
        self.events.emit(kind, SOURCE, data);
    }
}

fn task_for(signal: &Signal, rule: &SignalRule) -> Task {
    Task::new(
        signal.signal_type.code().to_ascii_lowercase(),
        signal.content.clone(),
    )
    .with_payload(json!({
        "source": signal.source,
        "signal": signal.signal_type,
        "category": rule.category,
        "urgency": rule.urgency,
        "metadata": signal.metadata,
    }))
}
