//! Signals from the project scanner and the fixed table that classifies them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::decision::Action;
use crate::agent::AgentType;

/// Short bracketed signal codes, e.g. `[BLOCKER]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalType {
    Blocker,
    Question,
    Progress,
    Completion,
    Bug,
    Test,
    Review,
    Security,
    Decision,
    Todo,
    Unknown(String),
}

impl SignalType {
    /// Parse a code with or without brackets, case-insensitively
    pub fn parse(code: &str) -> Self {
        let code = code.trim().trim_start_matches('[').trim_end_matches(']').trim();
        match code.to_ascii_uppercase().as_str() {
            "BLOCKER" | "BLOCKED" => SignalType::Blocker,
            "QUESTION" => SignalType::Question,
            "PROGRESS" => SignalType::Progress,
            "COMPLETE" | "COMPLETION" | "DONE" => SignalType::Completion,
            "BUG" | "ERROR" => SignalType::Bug,
            "TEST" => SignalType::Test,
            "REVIEW" => SignalType::Review,
            "SECURITY" => SignalType::Security,
            "DECISION" => SignalType::Decision,
            "TODO" => SignalType::Todo,
            _ => SignalType::Unknown(code.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            SignalType::Blocker => "BLOCKER",
            SignalType::Question => "QUESTION",
            SignalType::Progress => "PROGRESS",
            SignalType::Completion => "COMPLETION",
            SignalType::Bug => "BUG",
            SignalType::Test => "TEST",
            SignalType::Review => "REVIEW",
            SignalType::Security => "SECURITY",
            SignalType::Decision => "DECISION",
            SignalType::Todo => "TODO",
            SignalType::Unknown(code) => code,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())
    }
}

impl From<String> for SignalType {
    fn from(s: String) -> Self {
        SignalType::parse(&s)
    }
}

impl From<SignalType> for String {
    fn from(t: SignalType) -> Self {
        t.code().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Blocker,
    Question,
    Progress,
    Completion,
    Defect,
    Quality,
    Security,
    Decision,
    Work,
    Unknown,
}

/// What the lookup table says about a signal type
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRule {
    pub category: SignalCategory,
    /// 0-1, higher is more pressing
    pub urgency: f64,
    pub action: Action,
    /// How sure the table is about `action`
    pub confidence: f64,
    /// Role the work goes to when delegated
    pub role: Option<AgentType>,
}

pub fn rule_for(signal_type: &SignalType) -> SignalRule {
    use SignalCategory as C;
    let (category, urgency, action, confidence, role) = match signal_type {
        SignalType::Blocker => (C::Blocker, 0.9, Action::Delegate, 0.85, Some(AgentType::Developer)),
        SignalType::Question => (C::Question, 0.6, Action::RequestGuidance, 0.8, None),
        SignalType::Progress => (C::Progress, 0.2, Action::Archive, 0.95, None),
        SignalType::Completion => (C::Completion, 0.3, Action::Archive, 0.95, None),
        SignalType::Bug => (C::Defect, 0.8, Action::Delegate, 0.8, Some(AgentType::Developer)),
        SignalType::Test => (C::Quality, 0.5, Action::Delegate, 0.8, Some(AgentType::Qa)),
        SignalType::Review => (C::Quality, 0.5, Action::Delegate, 0.75, Some(AgentType::Reviewer)),
        SignalType::Security => (C::Security, 1.0, Action::Escalate, 0.9, None),
        SignalType::Decision => (C::Decision, 0.7, Action::RequestGuidance, 0.75, None),
        SignalType::Todo => (C::Work, 0.4, Action::Delegate, 0.75, Some(AgentType::Developer)),
        SignalType::Unknown(_) => (C::Unknown, 0.1, Action::RequestGuidance, 0.3, None),
    };
    SignalRule {
        category,
        urgency,
        action,
        confidence,
        role,
    }
}

/// One structured record from the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub source: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Signal {
    pub fn new(code: &str, source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            signal_type: SignalType::parse(code),
            source: source.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn rule(&self) -> SignalRule {
        rule_for(&self.signal_type)
    }

    /// Target role; an `agent_type` metadata entry overrides the table
    pub fn role(&self, rule: &SignalRule) -> Option<AgentType> {
        self.metadata
            .get("agent_type")
            .and_then(Value::as_str)
            .map(AgentType::from_str)
            .or_else(|| rule.role.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bracketed_codes() {
        assert_eq!(SignalType::parse("[BLOCKER]"), SignalType::Blocker);
        assert_eq!(SignalType::parse("completion"), SignalType::Completion);
        assert_eq!(SignalType::parse(" [done] "), SignalType::Completion);
        assert_eq!(
            SignalType::parse("[WHATEVER]"),
            SignalType::Unknown("WHATEVER".into())
        );
        assert_eq!(SignalType::Blocker.to_string(), "[BLOCKER]");
    }

    #[test]
    fn lookup_is_deterministic() {
        let blocker = rule_for(&SignalType::Blocker);
        assert_eq!(blocker.action, Action::Delegate);
        assert_eq!(blocker.role, Some(AgentType::Developer));
        assert_eq!(blocker, rule_for(&SignalType::Blocker));

        assert_eq!(rule_for(&SignalType::Progress).action, Action::Archive);
        assert_eq!(rule_for(&SignalType::Security).action, Action::Escalate);
        assert!(rule_for(&SignalType::Unknown("X".into())).confidence < 0.5);
    }

    #[test]
    fn metadata_overrides_role() {
        let signal =
            Signal::new("[BUG]", "src/lib.rs:10", "panics").with_metadata("agent_type", json!("qa"));
        assert_eq!(signal.role(&signal.rule()), Some(AgentType::Qa));
    }

    #[test]
    fn deserializes_scanner_records() {
        let signal: Signal = serde_json::from_value(json!({
            "type": "[TEST]",
            "source": "tests/api.rs",
            "content": "flaky",
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(signal.signal_type, SignalType::Test);
        assert!(signal.metadata.is_empty());
    }
}
