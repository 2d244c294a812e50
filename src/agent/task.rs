//! Units of work handed to agents

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// A unit of work for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Short kind such as `test`, `fix`, `review`
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub payload: Value,
}

impl Task {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("task-{}", &id[..12]),
            task_type: task_type.into(),
            description: description.into(),
            payload: Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Falls back to the agent's `max_execution_ms`
    pub timeout: Option<Duration>,
    pub track_tokens: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            track_tokens: true,
        }
    }
}

impl TaskOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub success: bool,
    pub output: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub duration: Duration,
}
