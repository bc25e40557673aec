// src/monitor/handle.rs
use super::engine::Shared;
use super::MonitorError;
use crate::registry::{RegistryDiff, RegistrySnapshot, Target, TargetId};
use crate::scheduler::{jitter, ScheduleEntry};
use crate::state::{Status, TargetState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// How the final drain went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Probes in flight when the stop request arrived.
    pub in_flight: usize,
    pub cancelled: usize,
    /// Probes that reported a regular outcome during the drain.
    pub completed: usize,
    /// Probes still running when the drain timeout expired.
    pub abandoned: usize,
}

/// Handle to a running monitor. Dropping it stops the monitor without
/// waiting for the drain.
pub struct MonitorHandle {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    engine: JoinHandle<DrainReport>,
}

impl MonitorHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        shutdown_tx: watch::Sender<bool>,
        engine: JoinHandle<DrainReport>,
    ) -> Self {
        Self {
            shared,
            shutdown_tx,
            engine,
        }
    }

    pub fn snapshot(&self, target_id: &str) -> Option<TargetState> {
        self.shared.state.snapshot(target_id)
    }

    pub fn snapshot_all(&self) -> BTreeMap<TargetId, TargetState> {
        self.shared.state.snapshot_all()
    }

    pub fn schedule(&self, target_id: &str) -> Option<ScheduleEntry> {
        self.shared.scheduler().entry(target_id).cloned()
    }

    pub fn is_in_flight(&self, target_id: &str) -> bool {
        self.shared.scheduler().is_in_flight(target_id)
    }

    pub fn targets(&self) -> Arc<RegistrySnapshot> {
        self.shared.registry.snapshot()
    }

    /// Targets currently at each status.
    pub fn status_counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        for state in self.snapshot_all().values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    /// Swap in a new target set. Added targets start Unknown and due now;
    /// removed targets lose their state and any in-flight result is ignored;
    /// changed targets keep their health state but restart their schedule.
    pub fn reload(&self, targets: Vec<Target>) -> Result<RegistryDiff, MonitorError> {
        super::validate_targets(&targets)?;
        let diff = self.shared.registry.replace(targets)?;
        if diff.is_empty() {
            return Ok(diff);
        }
        let snapshot = self.shared.registry.snapshot();
        let now = Instant::now();

        {
            let mut scheduler = self.shared.scheduler();
            for id in &diff.removed {
                scheduler.remove(id);
                self.shared.state.remove(id);
                if let Some(metrics) = &self.shared.metrics {
                    metrics.remove_target(id);
                }
            }
            for id in diff.added.iter().chain(&diff.changed) {
                if let Some(target) = snapshot.get(id) {
                    scheduler.insert(id.clone(), target.interval, now + jitter(self.shared.jitter));
                    self.shared.state.register(id.clone());
                }
            }
        }

        if let Some(metrics) = &self.shared.metrics {
            metrics.set_target_count(snapshot.len());
            for id in &diff.added {
                metrics.update_target(id, Status::Unknown, 1);
            }
        }

        info!(
            generation = snapshot.generation(),
            targets = snapshot.len(),
            "Applied target reload"
        );
        self.shared.wake.notify_one();
        Ok(diff)
    }

    pub fn is_running(&self) -> bool {
        !self.engine.is_finished()
    }

    /// Cancel in-flight probes and wait for the drain to finish.
    pub async fn stop(self) -> Result<DrainReport, MonitorError> {
        self.shutdown_tx.send_replace(true);
        self.engine
            .await
            .map_err(|e| MonitorError::EngineFailed(e.to_string()))
    }
}
