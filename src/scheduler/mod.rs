// src/scheduler/mod.rs
//! When each target is probed next.
//!
//! Entries are ordered by (next due, target id), so equal due times come out
//! in identifier order. A dispatched target stays in the schedule but is
//! marked in flight and skipped by [`Scheduler::due`] until its probe
//! reports back; only then is its next due time recomputed.

mod backoff;

pub use backoff::{jitter, BackoffPolicy};

use crate::registry::TargetId;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub target_id: TargetId,
    #[serde(skip)]
    pub next_due: Instant,
    pub base_interval: Duration,
    pub current_interval: Duration,
    /// Bumped whenever the target is (re)inserted; results dispatched under an
    /// older epoch are stale.
    #[serde(skip)]
    pub epoch: u64,
}

pub struct Scheduler {
    policy: BackoffPolicy,
    entries: HashMap<TargetId, ScheduleEntry>,
    queue: BTreeSet<(Instant, TargetId)>,
    in_flight: HashMap<TargetId, u64>,
    next_epoch: u64,
}

impl Scheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            queue: BTreeSet::new(),
            in_flight: HashMap::new(),
            next_epoch: 0,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Add a target, due at `first_due`. Re-inserting an existing id starts a new epoch.
    pub fn insert(&mut self, target_id: TargetId, base_interval: Duration, first_due: Instant) {
        self.remove(&target_id);

        self.next_epoch += 1;
        let entry = ScheduleEntry {
            target_id: target_id.clone(),
            next_due: first_due,
            base_interval,
            current_interval: base_interval,
            epoch: self.next_epoch,
        };
        self.queue.insert((first_due, target_id.clone()));
        self.entries.insert(target_id, entry);
    }

    /// Drop a target. An in-flight probe keeps its in-flight mark until it reports.
    pub fn remove(&mut self, target_id: &str) -> bool {
        match self.entries.remove(target_id) {
            Some(entry) => {
                self.queue.remove(&(entry.next_due, entry.target_id));
                true
            }
            None => false,
        }
    }

    /// Change a target's base interval; takes effect at its next reschedule.
    pub fn set_base_interval(&mut self, target_id: &str, base_interval: Duration) {
        if let Some(entry) = self.entries.get_mut(target_id) {
            entry.base_interval = base_interval;
        }
    }

    /// Targets whose due time has passed and which are not in flight,
    /// earliest first. Nothing is removed.
    pub fn due(&self, now: Instant) -> Vec<TargetId> {
        self.queue
            .iter()
            .take_while(|(due, _)| *due <= now)
            .filter(|(_, id)| !self.in_flight.contains_key(id))
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Mark a target as dispatched. Returns the epoch to report back with, or
    /// `None` if the target is unknown or already in flight.
    pub fn mark_in_flight(&mut self, target_id: &str) -> Option<u64> {
        if self.in_flight.contains_key(target_id) {
            return None;
        }
        let epoch = self.entries.get(target_id)?.epoch;
        self.in_flight.insert(target_id.to_string(), epoch);
        Some(epoch)
    }

    /// Clear the in-flight mark. Returns whether the result belongs to the
    /// current schedule entry (false for removed or re-inserted targets).
    pub fn finish(&mut self, target_id: &str, epoch: u64) -> bool {
        match self.in_flight.get(target_id) {
            Some(current) if *current == epoch => {
                self.in_flight.remove(target_id);
            }
            _ => return false,
        }
        self.entries
            .get(target_id)
            .map(|entry| entry.epoch == epoch)
            .unwrap_or(false)
    }

    /// Schedule the next probe at `now + base * multiplier` (capped).
    pub fn reschedule(&mut self, target_id: &str, now: Instant, multiplier: u32) -> Option<&ScheduleEntry> {
        let entry = self.entries.get_mut(target_id)?;
        self.queue.remove(&(entry.next_due, entry.target_id.clone()));

        entry.current_interval = self.policy.interval(entry.base_interval, multiplier);
        entry.next_due = now + entry.current_interval;
        self.queue.insert((entry.next_due, entry.target_id.clone()));

        Some(entry)
    }

    /// Earliest due time among targets not in flight.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.queue
            .iter()
            .find(|(_, id)| !self.in_flight.contains_key(id))
            .map(|(due, _)| *due)
    }

    pub fn entry(&self, target_id: &str) -> Option<&ScheduleEntry> {
        self.entries.get(target_id)
    }

    pub fn is_in_flight(&self, target_id: &str) -> bool {
        self.in_flight.contains_key(target_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
