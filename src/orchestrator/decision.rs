//! Decisions and the bounded reasoning that produces them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Delegate,
    Escalate,
    Archive,
    RequestGuidance,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Delegate => "delegate",
            Action::Escalate => "escalate",
            Action::Archive => "archive",
            Action::RequestGuidance => "request-guidance",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub index: usize,
    pub thought: String,
}

/// Reasoning trace capped at a fixed number of steps
#[derive(Debug, Clone)]
pub struct ReasoningChain {
    max_depth: usize,
    steps: Vec<ReasoningStep>,
    truncated: bool,
}

impl ReasoningChain {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            steps: Vec::new(),
            truncated: false,
        }
    }

    /// Record a step. Returns false once the depth is used up.
    pub fn step(&mut self, thought: impl Into<String>) -> bool {
        if self.steps.len() >= self.max_depth {
            self.truncated = true;
            return false;
        }
        self.steps.push(ReasoningStep {
            index: self.steps.len(),
            thought: thought.into(),
        });
        true
    }

    /// Record the final step, overwriting the last one when the chain is full
    pub fn conclude(&mut self, thought: impl Into<String>) {
        let thought = thought.into();
        if self.steps.len() < self.max_depth {
            self.steps.push(ReasoningStep {
                index: self.steps.len(),
                thought,
            });
        } else if let Some(last) = self.steps.last_mut() {
            last.thought = thought;
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<ReasoningStep> {
        self.steps
    }
}

/// Orchestrator output. Never mutated once built.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub id: Uuid,
    /// Signal code that triggered it
    pub signal: String,
    pub target_agent: Option<String>,
    pub action: Action,
    pub reasoning: Vec<ReasoningStep>,
    pub confidence: f64,
    /// Operations invoked while deciding
    pub tools: Vec<String>,
    pub context_tokens: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_stops_at_depth() {
        let mut chain = ReasoningChain::new(2);
        assert!(chain.step("one"));
        assert!(chain.step("two"));
        assert!(!chain.step("three"));
        assert!(chain.is_truncated());
        assert_eq!(chain.len(), 2);

        chain.conclude("escalate");
        let steps = chain.into_steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].thought, "escalate");
        assert_eq!(steps[1].index, 1);
    }

    #[test]
    fn action_names() {
        assert_eq!(
            serde_json::to_string(&Action::RequestGuidance).unwrap(),
            "\"request-guidance\""
        );
        assert_eq!(Action::Delegate.to_string(), "delegate");
    }
}
