use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::TokenUsageEvent;

#[derive(Debug, Default, Clone)]
struct TrackerState {
    total: u64,
    by_issue: HashMap<u64, u64>,
    by_agent: HashMap<String, u64>,
    by_phase: HashMap<u32, u64>,
    record_count: u64,
}

/// In-memory token-usage accumulator shared across the agents working on a
/// single fleet run (spec §4.2). Every `record` call is pure addition — the
/// invariant `total == sum(byIssue) == sum(byAgent) == sum(byPhase)` holds
/// after every call since every event increments all four in lockstep.
#[derive(Clone, Default)]
pub struct TokenTracker {
    state: Arc<Mutex<TrackerState>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenSummary {
    pub total: u64,
    pub record_count: u64,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &TokenUsageEvent) {
        let mut state = self.state.lock().expect("token tracker mutex poisoned");
        state.total += event.tokens;
        *state.by_issue.entry(event.issue_number).or_insert(0) += event.tokens;
        *state.by_agent.entry(event.agent.clone()).or_insert(0) += event.tokens;
        *state.by_phase.entry(event.phase).or_insert(0) += event.tokens;
        state.record_count += 1;
    }

    pub fn get_total(&self) -> u64 {
        self.state.lock().expect("token tracker mutex poisoned").total
    }

    pub fn get_total_for_issue(&self, issue_number: u64) -> u64 {
        self.state
            .lock()
            .expect("token tracker mutex poisoned")
            .by_issue
            .get(&issue_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn get_summary(&self) -> TokenSummary {
        let state = self.state.lock().expect("token tracker mutex poisoned");
        TokenSummary {
            total: state.total,
            record_count: state.record_count,
        }
    }

    pub fn by_agent(&self) -> HashMap<String, u64> {
        self.state.lock().expect("token tracker mutex poisoned").by_agent.clone()
    }

    pub fn by_phase(&self) -> HashMap<u32, u64> {
        self.state.lock().expect("token tracker mutex poisoned").by_phase.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(agent: &str, phase: u32, issue_number: u64, tokens: u64) -> TokenUsageEvent {
        TokenUsageEvent {
            agent: agent.to_string(),
            phase,
            issue_number,
            tokens,
        }
    }

    #[test]
    fn conserves_totals_across_dimensions() {
        let tracker = TokenTracker::new();
        tracker.record(&event("scoper", 1, 10, 100));
        tracker.record(&event("planner", 2, 10, 50));
        tracker.record(&event("coder", 3, 11, 200));

        assert_eq!(tracker.get_total(), 350);
        assert_eq!(tracker.get_total_for_issue(10), 150);
        assert_eq!(tracker.get_total_for_issue(11), 200);
        assert_eq!(tracker.by_agent().values().sum::<u64>(), 350);
        assert_eq!(tracker.by_phase().values().sum::<u64>(), 350);
    }

    #[test]
    fn get_summary_counts_records_not_tokens() {
        let tracker = TokenTracker::new();
        tracker.record(&event("scoper", 1, 1, 5));
        tracker.record(&event("scoper", 1, 1, 5));
        let summary = tracker.get_summary();
        assert_eq!(summary.total, 10);
        assert_eq!(summary.record_count, 2);
    }

    #[test]
    fn unknown_issue_returns_zero() {
        let tracker = TokenTracker::new();
        assert_eq!(tracker.get_total_for_issue(999), 0);
    }
}
