// src/state/target_state.rs
use super::window::LatencyWindow;
use crate::probe::{Outcome, ProbeResult};
use crate::registry::TargetId;
use crate::scheduler::BackoffPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
    Unknown,
}

/// Rules for folding probe results into a [`TargetState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationPolicy {
    pub failure_threshold: u32,
    pub latency_window: usize,
    pub backoff: BackoffPolicy,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            latency_window: 32,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetState {
    pub target_id: TargetId,
    pub status: Status,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
    pub last_message: Option<String>,
    pub backoff_multiplier: u32,
    pub total_probes: u64,
    /// Cycles in which the probe could not run at all.
    pub skipped: u64,
    pub last_skipped: Option<DateTime<Utc>>,
    pub latencies: LatencyWindow,
}

impl TargetState {
    pub fn new(target_id: impl Into<TargetId>, latency_window: usize) -> Self {
        Self {
            target_id: target_id.into(),
            status: Status::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success: None,
            last_failure: None,
            last_outcome: None,
            last_message: None,
            backoff_multiplier: 1,
            total_probes: 0,
            skipped: 0,
            last_skipped: None,
            latencies: LatencyWindow::new(latency_window),
        }
    }

    /// Fold one result in. Cancelled results must be filtered by the caller.
    pub(crate) fn record(&mut self, result: ProbeResult, policy: &AggregationPolicy) {
        match result.outcome {
            Outcome::Success => {
                self.total_probes += 1;
                self.status = Status::Up;
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.last_success = Some(result.timestamp);
                self.backoff_multiplier = 1;
                if let Some(latency) = result.latency {
                    self.latencies.push(latency);
                }
            }
            Outcome::Skipped => {
                self.skipped += 1;
                self.last_skipped = Some(result.timestamp);
            }
            Outcome::Cancelled => return,
            _ => {
                self.total_probes += 1;
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure = Some(result.timestamp);
                self.backoff_multiplier = policy.backoff.escalate(self.backoff_multiplier);
                if self.consecutive_failures >= policy.failure_threshold {
                    self.status = Status::Down;
                }
            }
        }

        self.last_outcome = Some(result.outcome);
        self.last_message = result.message;
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        self.latencies.mean()
    }

    pub fn latency_percentile(&self, p: f64) -> Option<Duration> {
        self.latencies.percentile(p)
    }
}
