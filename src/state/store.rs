// src/state/store.rs
use super::target_state::{AggregationPolicy, Status, TargetState};
use crate::probe::{Outcome, ProbeResult};
use crate::registry::TargetId;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What [`StateStore::apply`] did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated {
        previous: Status,
        current: Status,
        backoff_multiplier: u32,
    },
    /// Cancelled probes carry no health signal.
    DroppedCancelled,
    /// The target was removed while its probe was in flight.
    DroppedUnknownTarget,
}

impl Applied {
    pub fn transitioned(&self) -> bool {
        matches!(self, Applied::Updated { previous, current, .. } if previous != current)
    }
}

/// Per-target health state. The only writer is [`StateStore::apply`];
/// everyone else reads copies.
///
/// Each target lives in its own map shard entry, so updates to different
/// targets never contend on one lock.
pub struct StateStore {
    states: DashMap<TargetId, TargetState>,
    policy: AggregationPolicy,
}

impl StateStore {
    pub fn new(policy: AggregationPolicy) -> Self {
        Self {
            states: DashMap::new(),
            policy,
        }
    }

    pub fn with_targets<I, S>(policy: AggregationPolicy, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TargetId>,
    {
        let store = Self::new(policy);
        for id in ids {
            store.register(id);
        }
        store
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Start tracking a target as Unknown. Existing state is kept.
    pub fn register(&self, target_id: impl Into<TargetId>) {
        let target_id = target_id.into();
        self.states
            .entry(target_id.clone())
            .or_insert_with(|| TargetState::new(target_id, self.policy.latency_window));
    }

    pub fn remove(&self, target_id: &str) -> bool {
        self.states.remove(target_id).is_some()
    }

    pub fn apply(&self, result: ProbeResult) -> Applied {
        if result.outcome == Outcome::Cancelled {
            debug!(target = %result.target_id, "Dropping cancelled probe result");
            return Applied::DroppedCancelled;
        }

        let mut state = match self.states.get_mut(&result.target_id) {
            Some(state) => state,
            None => {
                debug!(target = %result.target_id, "Dropping result for removed target");
                return Applied::DroppedUnknownTarget;
            }
        };

        let previous = state.status;
        let outcome = result.outcome;
        state.record(result, &self.policy);
        let current = state.status;

        if previous != current {
            match current {
                Status::Up => info!(
                    target = %state.target_id,
                    from = ?previous,
                    "Target is up"
                ),
                Status::Down => warn!(
                    target = %state.target_id,
                    consecutive_failures = state.consecutive_failures,
                    outcome = %outcome,
                    message = ?state.last_message,
                    "Target is down"
                ),
                Status::Unknown => {}
            }
        }

        Applied::Updated {
            previous,
            current,
            backoff_multiplier: state.backoff_multiplier,
        }
    }

    pub fn snapshot(&self, target_id: &str) -> Option<TargetState> {
        self.states.get(target_id).map(|state| state.clone())
    }

    /// Copies of every target's state, ordered by id. Each entry is internally
    /// consistent; entries are copied one shard at a time.
    pub fn snapshot_all(&self) -> BTreeMap<TargetId, TargetState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn backoff_multiplier(&self, target_id: &str) -> Option<u32> {
        self.states.get(target_id).map(|state| state.backoff_multiplier)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
