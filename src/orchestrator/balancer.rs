//! Agent selection and retry pacing

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::agent::AgentStatus;
use crate::config::{Backoff, CoordinationConfig, LoadBalancing};

/// Orders eligible agents for one delegation.
///
/// Candidates arrive best first (priority, then registration). Round-robin
/// rotates that list with one cursor per role; least-busy moves the agents
/// with fewer active tasks forward, keeping the incoming order on ties.
pub struct LoadBalancer {
    strategy: LoadBalancing,
    cursors: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancing) -> Self {
        Self {
            strategy,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> LoadBalancing {
        self.strategy
    }

    /// Full attempt order; retries walk down it
    pub fn order(&self, role: &str, mut candidates: Vec<AgentStatus>) -> Vec<AgentStatus> {
        if candidates.len() < 2 {
            return candidates;
        }
        match self.strategy {
            LoadBalancing::RoundRobin => {
                let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
                let cursor = cursors.entry(role.to_string()).or_insert(0);
                let start = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                candidates.rotate_left(start);
            }
            LoadBalancing::LeastBusy => {
                candidates.sort_by_key(|a| a.active_tasks);
            }
        }
        candidates
    }
}

/// Wait before retry number `retry` (0 for the first retry)
pub fn backoff_delay(config: &CoordinationConfig, retry: u32) -> Duration {
    let base = config.retry_delay_ms;
    let delay = match config.backoff {
        Backoff::Fixed => base,
        Backoff::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
    };
    Duration::from_millis(delay.min(config.max_retry_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, AgentType};
    use chrono::Utc;

    fn agent(id: &str, registration: u64, active_tasks: usize) -> AgentStatus {
        AgentStatus {
            id: id.to_string(),
            agent_type: AgentType::Developer,
            enabled: true,
            priority: 5,
            registration,
            state: AgentState::Running,
            start_time: Some(Utc::now()),
            last_activity: Utc::now(),
            error_count: 0,
            uptime: Duration::ZERO,
            session_id: Some(format!("ses-{}", id)),
            active_tasks,
            tokens_today: 0,
            total_cost: 0.0,
            last_error: None,
        }
    }

    fn ids(agents: &[AgentStatus]) -> Vec<&str> {
        agents.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn round_robin_rotates_per_role() {
        let balancer = LoadBalancer::new(LoadBalancing::RoundRobin);
        let pool = || vec![agent("a", 0, 0), agent("b", 1, 0), agent("c", 2, 0)];

        assert_eq!(ids(&balancer.order("developer", pool())), ["a", "b", "c"]);
        assert_eq!(ids(&balancer.order("developer", pool())), ["b", "c", "a"]);
        assert_eq!(ids(&balancer.order("qa", pool())), ["a", "b", "c"]);
        assert_eq!(ids(&balancer.order("developer", pool())), ["c", "a", "b"]);
        assert_eq!(ids(&balancer.order("developer", pool())), ["a", "b", "c"]);
    }

    #[test]
    fn least_busy_prefers_fewer_tasks_and_keeps_ties_stable() {
        let balancer = LoadBalancer::new(LoadBalancing::LeastBusy);
        let ordered = balancer.order(
            "developer",
            vec![agent("a", 0, 2), agent("b", 1, 0), agent("c", 2, 0)],
        );
        assert_eq!(ids(&ordered), ["b", "c", "a"]);
    }

    #[test]
    fn backoff_strategies() {
        let mut config = CoordinationConfig {
            retry_delay_ms: 100,
            max_retry_delay_ms: 500,
            backoff: Backoff::Exponential,
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 64), Duration::from_millis(500));

        config.backoff = Backoff::Fixed;
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(100));
    }
}
