// src/monitor/engine.rs
use super::DrainReport;
use crate::executor::{Completion, Executor};
use crate::metrics::MetricsCollector;
use crate::probe::Outcome;
use crate::registry::{Target, TargetRegistry};
use crate::scheduler::Scheduler;
use crate::state::{Applied, StateStore};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on how long the loop sleeps when nothing is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// State shared between the main loop and the handle.
pub(crate) struct Shared {
    pub(crate) registry: TargetRegistry,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) state: StateStore,
    /// Wakes the loop after the schedule changed from outside.
    pub(crate) wake: Notify,
    pub(crate) metrics: Option<Arc<MetricsCollector>>,
    pub(crate) jitter: Duration,
}

impl Shared {
    /// Never held across an await.
    pub(crate) fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    executor: Executor,
    completions: mpsc::UnboundedReceiver<Completion>,
    shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl Engine {
    pub(crate) fn new(
        shared: Arc<Shared>,
        executor: Executor,
        completions: mpsc::UnboundedReceiver<Completion>,
        shutdown: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            executor,
            completions,
            shutdown,
            drain_timeout,
        }
    }

    pub(crate) async fn run(mut self) -> DrainReport {
        loop {
            self.dispatch_due();

            let wakeup = self
                .shared
                .scheduler()
                .next_wakeup()
                .unwrap_or_else(|| Instant::now() + IDLE_POLL);

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    // a dropped handle counts as a stop request
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                Some(completion) = self.completions.recv() => {
                    self.complete(completion);
                }
                _ = self.shared.wake.notified() => {}
                _ = sleep_until(wakeup) => {}
            }
        }

        self.drain().await
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        let mut batch: Vec<(Arc<Target>, u64)> = Vec::new();
        {
            let mut scheduler = self.shared.scheduler();
            for id in scheduler.due(now) {
                let target = match self.shared.registry.get(&id) {
                    Some(target) => target,
                    None => {
                        warn!(target = %id, "Scheduled target missing from registry");
                        scheduler.remove(&id);
                        continue;
                    }
                };
                if let Some(epoch) = scheduler.mark_in_flight(&id) {
                    batch.push((target, epoch));
                }
            }
        }

        if !batch.is_empty() {
            debug!(count = batch.len(), "Dispatching due probes");
        }
        for (target, epoch) in batch {
            self.executor.dispatch(target, epoch);
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { epoch, result } = completion;
        let target_id = result.target_id.clone();
        let now = Instant::now();

        if !self.shared.scheduler().finish(&target_id, epoch) {
            debug!(target = %target_id, epoch, "Discarding stale probe result");
            return;
        }

        let multiplier = match self.shared.state.apply(result) {
            Applied::Updated {
                current,
                backoff_multiplier,
                ..
            } => {
                if let Some(metrics) = &self.shared.metrics {
                    metrics.update_target(&target_id, current, backoff_multiplier);
                }
                backoff_multiplier
            }
            Applied::DroppedCancelled | Applied::DroppedUnknownTarget => self
                .shared
                .state
                .backoff_multiplier(&target_id)
                .unwrap_or(1),
        };

        if let Some(entry) = self.shared.scheduler().reschedule(&target_id, now, multiplier) {
            debug!(
                target = %target_id,
                interval = ?entry.current_interval,
                multiplier,
                "Rescheduled"
            );
        }
    }

    /// Cancel everything in flight and wait for it to report, up to the drain timeout.
    async fn drain(mut self) -> DrainReport {
        let in_flight = self.shared.scheduler().in_flight_count();
        info!(
            in_flight,
            drain_timeout = ?self.drain_timeout,
            "Stopping network monitor"
        );

        self.executor.cancel();

        let mut report = DrainReport {
            in_flight,
            ..DrainReport::default()
        };
        let deadline = Instant::now() + self.drain_timeout;

        while self.shared.scheduler().in_flight_count() > 0 {
            match timeout_at(deadline, self.completions.recv()).await {
                Ok(Some(completion)) => {
                    report.count(completion.result.outcome);
                    self.complete(completion);
                }
                Ok(None) => break,
                Err(_) => {
                    self.executor.abort_all();
                    while let Ok(completion) = self.completions.try_recv() {
                        report.count(completion.result.outcome);
                        self.complete(completion);
                    }
                    report.abandoned = self.shared.scheduler().in_flight_count();
                    error!(
                        abandoned = report.abandoned,
                        "Drain timeout expired, abandoning probes"
                    );
                    break;
                }
            }
        }

        info!(
            cancelled = report.cancelled,
            completed = report.completed,
            abandoned = report.abandoned,
            "Network monitor stopped"
        );
        report
    }
}

impl DrainReport {
    fn count(&mut self, outcome: Outcome) {
        if outcome == Outcome::Cancelled {
            self.cancelled += 1;
        } else {
            self.completed += 1;
        }
    }
}
