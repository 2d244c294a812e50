//! Decision context and its compression
//!
//! Context is a list of categorized segments. When it grows past the budget,
//! segments are retained by priority, then by most recent access, until the
//! target size is reached; everything after that is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accounting::estimate_tokens;

pub const CATEGORY_SIGNAL: &str = "signal";
pub const CATEGORY_AGENT_STATUS: &str = "agent_status";
pub const CATEGORY_ACTIVE_TASKS: &str = "active_tasks";
pub const CATEGORY_SIGNALS: &str = "signals";

#[derive(Debug, Clone)]
pub struct ContextSegment {
    pub category: String,
    /// Higher is kept first
    pub priority: u8,
    pub last_accessed: DateTime<Utc>,
    pub content: String,
    pub tokens: usize,
}

impl ContextSegment {
    pub fn new(category: &str, priority: u8, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            category: category.to_string(),
            priority,
            last_accessed: Utc::now(),
            tokens: estimate_tokens(&content) as usize,
            content,
        }
    }

    pub fn accessed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_accessed = at;
        self
    }
}

/// What one compression pass did
#[derive(Debug, Clone, Serialize)]
pub struct CompressionRecord {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub preserved_categories: Vec<String>,
    pub dropped_categories: Vec<String>,
    pub dropped_segments: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    segments: Vec<ContextSegment>,
}

impl DecisionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: ContextSegment) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[ContextSegment] {
        &self.segments
    }

    pub fn total_tokens(&self) -> usize {
        self.segments.iter().map(|s| s.tokens).sum()
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.segments.iter().any(|s| s.category == category)
    }

    /// Shrink to `target_ratio * max_tokens` when over `max_tokens`.
    ///
    /// Returns `None` when the context already fits.
    pub fn compress(&mut self, max_tokens: usize, target_ratio: f64) -> Option<CompressionRecord> {
        let original_tokens = self.total_tokens();
        if original_tokens <= max_tokens {
            return None;
        }
        let target = (max_tokens as f64 * target_ratio).floor() as usize;

        let mut order: Vec<usize> = (0..self.segments.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.segments[a], &self.segments[b]);
            b.priority
                .cmp(&a.priority)
                .then(b.last_accessed.cmp(&a.last_accessed))
        });

        let mut keep = vec![false; self.segments.len()];
        let mut used = 0;
        for index in order {
            let tokens = self.segments[index].tokens;
            if used + tokens > target {
                break;
            }
            used += tokens;
            keep[index] = true;
        }

        let mut preserved: Vec<String> = Vec::new();
        let mut dropped: Vec<String> = Vec::new();
        let mut dropped_segments = 0;
        let mut kept = Vec::new();
        for (segment, keep) in self.segments.drain(..).zip(keep) {
            if keep {
                if !preserved.contains(&segment.category) {
                    preserved.push(segment.category.clone());
                }
                kept.push(segment);
            } else {
                dropped_segments += 1;
                if !dropped.contains(&segment.category) {
                    dropped.push(segment.category);
                }
            }
        }
        dropped.retain(|c| !preserved.contains(c));
        self.segments = kept;

        Some(CompressionRecord {
            original_tokens,
            compressed_tokens: self.total_tokens(),
            preserved_categories: preserved,
            dropped_categories: dropped,
            dropped_segments,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn segment(category: &str, priority: u8, tokens: usize, age_secs: i64) -> ContextSegment {
        ContextSegment::new(category, priority, "x".repeat(tokens * 4))
            .accessed_at(Utc::now() - Duration::seconds(age_secs))
    }

    #[test]
    fn fits_without_compression() {
        let mut ctx = DecisionContext::new();
        ctx.push(segment(CATEGORY_SIGNAL, 10, 10, 0));
        assert!(ctx.compress(100, 0.8).is_none());
        assert_eq!(ctx.total_tokens(), 10);
    }

    #[test]
    fn keeps_priority_then_recency() {
        let mut ctx = DecisionContext::new();
        ctx.push(segment(CATEGORY_SIGNAL, 10, 30, 0));
        ctx.push(segment(CATEGORY_SIGNALS, 4, 20, 300));
        ctx.push(segment(CATEGORY_AGENT_STATUS, 8, 30, 0));
        ctx.push(segment(CATEGORY_SIGNALS, 4, 20, 10));
        ctx.push(segment(CATEGORY_ACTIVE_TASKS, 6, 30, 0));

        // 130 tokens against a budget of 100, target 80
        let record = ctx.compress(100, 0.8).unwrap();
        assert_eq!(record.original_tokens, 130);
        assert!(record.compressed_tokens <= 80);
        assert_eq!(record.compressed_tokens, 60);
        assert_eq!(
            record.preserved_categories,
            vec![CATEGORY_SIGNAL.to_string(), CATEGORY_AGENT_STATUS.to_string()]
        );
        assert!(record.dropped_categories.contains(&CATEGORY_ACTIVE_TASKS.to_string()));
        assert_eq!(record.dropped_segments, 3);
        assert!(!ctx.has_category(CATEGORY_SIGNALS));
    }

    #[test]
    fn recent_history_survives_over_old() {
        let mut ctx = DecisionContext::new();
        ctx.push(segment(CATEGORY_SIGNAL, 10, 10, 0));
        ctx.push(segment(CATEGORY_SIGNALS, 4, 20, 600));
        ctx.push(segment(CATEGORY_SIGNALS, 4, 20, 5));

        let record = ctx.compress(40, 0.8).unwrap();
        assert_eq!(record.compressed_tokens, 30);
        let kept = ctx.segments();
        assert_eq!(kept.len(), 2);
        assert!(Utc::now() - kept[1].last_accessed < Duration::seconds(60));
    }
}
