//! Token accounting boundary
//!
//! Pricing lives outside this crate. The lifecycle manager reports usage per
//! task and gets a cost figure back.

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;

/// One usage report
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub agent_id: String,
    pub operation: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[async_trait]
pub trait TokenAccountant: Send + Sync {
    /// Record usage and return its cost
    async fn record_usage(&self, usage: &UsageRecord) -> Result<f64>;
}

/// Accepts everything, costs nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccountant;

#[async_trait]
impl TokenAccountant for NoopAccountant {
    async fn record_usage(&self, usage: &UsageRecord) -> Result<f64> {
        tracing::trace!(
            agent_id = %usage.agent_id,
            operation = %usage.operation,
            tokens = usage.total_tokens(),
            "Usage recorded"
        );
        Ok(0.0)
    }
}

/// Rough token count for text, about four characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_round_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // chars, not bytes
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[tokio::test]
    async fn noop_accountant_is_free() {
        let usage = UsageRecord {
            agent_id: "dev-1".into(),
            operation: "task:test".into(),
            input_tokens: 10,
            output_tokens: 5,
            model: "default".into(),
        };
        assert_eq!(NoopAccountant.record_usage(&usage).await.unwrap(), 0.0);
        assert_eq!(usage.total_tokens(), 15);
    }
}
