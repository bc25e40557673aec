// src/executor/mod.rs
//! Runs probes with bounded concurrency.
//!
//! Every dispatched probe gets its own task. The task first waits for a
//! permit, then runs the prober under the target's deadline. Whatever
//! happens (success, failure, panic, overrun, cancellation) exactly one
//! [`Completion`] is sent back on the channel returned by [`Executor::new`].

use crate::config::Settings;
use crate::metrics::MetricsCollector;
use crate::probe::{cancelled, Outcome, ProbeContext, ProbeResult, Prober};
use crate::registry::Target;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("max_concurrency {0} exceeds the supported maximum of {1}")]
    TooManyPermits(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub max_concurrency: usize,
    /// Probes allowed to wait for a permit before new dispatches are skipped.
    pub max_pending: usize,
    /// How long a probe may run past its deadline before it is abandoned.
    pub grace: Duration,
}

impl ExecutorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            max_pending: settings.max_pending,
            grace: settings.grace(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Result of one dispatch, tagged with the schedule epoch it was issued under.
#[derive(Debug, Clone)]
pub struct Completion {
    pub epoch: u64,
    pub result: ProbeResult,
}

pub struct Executor {
    prober: Arc<dyn Prober>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    cancel_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    completions: mpsc::UnboundedSender<Completion>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Executor {
    pub fn new(
        prober: Arc<dyn Prober>,
        config: ExecutorConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Completion>), ExecutorError> {
        if config.max_concurrency == 0 {
            return Err(ExecutorError::ZeroConcurrency);
        }
        if config.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ExecutorError::TooManyPermits(
                config.max_concurrency,
                Semaphore::MAX_PERMITS,
            ));
        }

        let (cancel_tx, _) = watch::channel(false);
        let (completions, rx) = mpsc::unbounded_channel();

        let executor = Self {
            prober,
            config,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            waiting: Arc::new(AtomicUsize::new(0)),
            cancel_tx,
            tasks: JoinSet::new(),
            completions,
            metrics,
        };
        Ok((executor, rx))
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Queue a probe. Never blocks. A probe that finds a free permit starts
    /// right away; otherwise it waits in the queue, and if `max_pending`
    /// probes are already waiting a `Skipped` completion is sent instead.
    /// With `max_pending` at zero nothing ever queues.
    pub fn dispatch(&mut self, target: Arc<Target>, epoch: u64) {
        self.reap();

        if self.is_cancelled() {
            self.send(epoch, ProbeResult::cancelled(target.id.clone()));
            return;
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) if self.waiting.load(Ordering::Acquire) >= self.config.max_pending => {
                warn!(
                    target = %target.id,
                    waiting = self.config.max_pending,
                    "Probe queue full, skipping this cycle"
                );
                self.send(epoch, ProbeResult::skipped(target.id.clone(), "probe queue full"));
                return;
            }
            Err(_) => {
                self.waiting.fetch_add(1, Ordering::AcqRel);
                None
            }
        };

        let task = ProbeTask {
            prober: self.prober.clone(),
            target,
            epoch,
            grace: self.config.grace,
            permit,
            permits: self.permits.clone(),
            waiting: self.waiting.clone(),
            cancel: self.cancel_tx.subscribe(),
            completions: self.completions.clone(),
            metrics: self.metrics.clone(),
        };
        self.tasks.spawn(task.run());
    }

    /// Ask every queued and running probe to stop. Queued probes report
    /// `Cancelled` without running.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Tasks that have not finished yet.
    pub fn outstanding(&mut self) -> usize {
        self.reap();
        self.tasks.len()
    }

    /// Probes currently holding a permit.
    pub fn running(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    /// Probes waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Forcefully stop every task. Returns how many were still alive.
    pub fn abort_all(&mut self) -> usize {
        self.reap();
        let alive = self.tasks.len();
        self.tasks.abort_all();
        self.tasks.detach_all();
        alive
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("Probe task failed: {}", e);
                }
            }
        }
    }

    fn send(&self, epoch: u64, result: ProbeResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_probe(&result);
        }
        let _ = self.completions.send(Completion { epoch, result });
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

struct ProbeTask {
    prober: Arc<dyn Prober>,
    target: Arc<Target>,
    epoch: u64,
    grace: Duration,
    /// Granted at dispatch when a permit was free.
    permit: Option<OwnedSemaphorePermit>,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    cancel: watch::Receiver<bool>,
    completions: mpsc::UnboundedSender<Completion>,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Keeps the in-flight gauge raised while a probe holds its permit. Dropped
/// on every exit, including a task abort.
struct InFlight(Option<Arc<MetricsCollector>>);

impl InFlight {
    fn enter(metrics: Option<Arc<MetricsCollector>>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.probe_started();
        }
        Self(metrics)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(metrics) = &self.0 {
            metrics.probe_finished();
        }
    }
}

impl ProbeTask {
    async fn run(mut self) {
        let permit = match self.permit.take() {
            Some(permit) => Some(permit),
            None => {
                let permit = tokio::select! {
                    biased;
                    _ = cancelled(self.cancel.clone()) => None,
                    permit = self.permits.clone().acquire_owned() => permit.ok(),
                };
                self.waiting.fetch_sub(1, Ordering::AcqRel);
                permit
            }
        };

        let result = match permit {
            Some(_permit) => {
                let _in_flight = InFlight::enter(self.metrics.clone());
                self.execute().await
            }
            None => {
                debug!(target = %self.target.id, "Queued probe cancelled");
                ProbeResult::cancelled(self.target.id.clone())
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_probe(&result);
        }
        let _ = self.completions.send(Completion {
            epoch: self.epoch,
            result,
        });
    }

    /// Deadline starts when the permit is granted, not when the probe was queued.
    async fn execute(&self) -> ProbeResult {
        let target_id = self.target.id.clone();
        let deadline = Instant::now() + self.target.timeout;
        let ctx = ProbeContext::new(deadline, self.cancel.clone());

        let probe = AssertUnwindSafe(self.prober.probe(&self.target, &ctx)).catch_unwind();
        let probe = tokio::time::timeout_at(deadline + self.grace, probe);
        tokio::pin!(probe);

        let outcome = tokio::select! {
            outcome = &mut probe => outcome,
            _ = cancelled(self.cancel.clone()) => {
                // give the prober a chance to notice and clean up
                match tokio::time::timeout(self.grace, &mut probe).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(target = %target_id, "Probe ignored cancellation");
                        return ProbeResult::cancelled(target_id);
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(mut result)) => {
                if result.target_id != target_id {
                    result.target_id = target_id;
                }
                result
            }
            Ok(Err(panic)) => {
                error!(
                    target = %target_id,
                    panic = %panic_message(&*panic),
                    "Probe panicked"
                );
                ProbeResult::skipped(target_id, "probe panicked")
            }
            Err(_) => {
                warn!(
                    target = %target_id,
                    timeout = ?self.target.timeout,
                    "Probe overran its deadline"
                );
                ProbeResult::failure(target_id, Outcome::Timeout, "probe overran its deadline")
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Sleeps for a fixed time, tracking how many probes overlap.
    struct SlowProber {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowProber {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for SlowProber {
        async fn probe(&self, target: &Target, ctx: &ProbeContext) -> ProbeResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = ctx.run("connect", tokio::time::sleep(self.delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(()) => ProbeResult::success(target.id.clone(), self.delay),
                Err(e) => ProbeResult::from_error(target.id.clone(), e),
            }
        }
    }

    struct PanickingProber;

    #[async_trait]
    impl Prober for PanickingProber {
        async fn probe(&self, target: &Target, _ctx: &ProbeContext) -> ProbeResult {
            if target.id == "boom" {
                panic!("prober bug");
            }
            ProbeResult::success(target.id.clone(), Duration::from_millis(1))
        }
    }

    /// Ignores the context entirely.
    struct StuckProber;

    #[async_trait]
    impl Prober for StuckProber {
        async fn probe(&self, target: &Target, _ctx: &ProbeContext) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeResult::success(target.id.clone(), Duration::from_secs(3600))
        }
    }

    fn target(id: &str, timeout: Duration) -> Arc<Target> {
        Arc::new(Target::tcp(id, "127.0.0.1", 9).with_timeout(timeout))
    }

    fn config(max_concurrency: usize, max_pending: usize) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency,
            max_pending,
            grace: Duration::from_millis(500),
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<Completion>, n: usize) -> Vec<Completion> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            out.push(rx.recv().await.unwrap());
        }
        out
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let result = Executor::new(Arc::new(StuckProber), config(0, 10), None);
        assert!(matches!(result, Err(ExecutorError::ZeroConcurrency)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_never_exceeded() {
        let prober = Arc::new(SlowProber::new(Duration::from_secs(1)));
        let (mut executor, mut rx) = Executor::new(prober.clone(), config(3, 100), None).unwrap();

        for i in 0..10 {
            executor.dispatch(target(&format!("t{}", i), Duration::from_secs(5)), 1);
        }
        let completions = collect(&mut rx, 10).await;

        assert!(completions.iter().all(|c| c.result.outcome == Outcome::Success));
        assert_eq!(prober.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_starts_at_permit() {
        // second probe waits 1s for the permit but still gets its full 1.5s
        let prober = Arc::new(SlowProber::new(Duration::from_secs(1)));
        let (mut executor, mut rx) = Executor::new(prober, config(1, 10), None).unwrap();

        executor.dispatch(target("a", Duration::from_millis(1500)), 1);
        executor.dispatch(target("b", Duration::from_millis(1500)), 1);
        let completions = collect(&mut rx, 2).await;

        assert!(completions.iter().all(|c| c.result.outcome == Outcome::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_limit_skips() {
        let prober = Arc::new(SlowProber::new(Duration::from_secs(1)));
        let (mut executor, mut rx) = Executor::new(prober, config(1, 2), None).unwrap();

        // a takes the only permit, b and c fill the queue
        for id in ["a", "b", "c", "d"] {
            executor.dispatch(target(id, Duration::from_secs(5)), 7);
        }
        assert_eq!(executor.waiting(), 2);

        let completions = collect(&mut rx, 4).await;
        let skipped: Vec<_> = completions
            .iter()
            .filter(|c| c.result.outcome == Outcome::Skipped)
            .map(|c| (c.result.target_id.as_str(), c.epoch))
            .collect();
        assert_eq!(skipped, vec![("d", 7)]);
        assert_eq!(
            completions
                .iter()
                .filter(|c| c.result.outcome == Outcome::Success)
                .count(),
            3
        );
        assert_eq!(executor.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_permits_never_count_as_pending() {
        let prober = Arc::new(SlowProber::new(Duration::from_secs(1)));
        let (mut executor, mut rx) = Executor::new(prober.clone(), config(4, 1), None).unwrap();

        for id in ["a", "b", "c"] {
            executor.dispatch(target(id, Duration::from_secs(5)), 1);
        }
        assert_eq!(executor.waiting(), 0);

        let completions = collect(&mut rx, 3).await;
        assert!(completions.iter().all(|c| c.result.outcome == Outcome::Success));
        assert_eq!(prober.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_pending_runs_without_queue() {
        let prober = Arc::new(SlowProber::new(Duration::from_secs(1)));
        let (mut executor, mut rx) = Executor::new(prober, config(1, 0), None).unwrap();

        executor.dispatch(target("a", Duration::from_secs(5)), 1);
        executor.dispatch(target("b", Duration::from_secs(5)), 1);

        // b is rejected immediately, a still runs
        let first = rx.recv().await.unwrap();
        assert_eq!(first.result.target_id, "b");
        assert_eq!(first.result.outcome, Outcome::Skipped);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.result.target_id, "a");
        assert_eq!(second.result.outcome, Outcome::Success);

        // once the permit is back the next cycle runs
        executor.dispatch(target("b", Duration::from_secs(5)), 2);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.result.outcome, Outcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_lowers_in_flight_gauge() {
        let registry = crate::metrics::MetricsRegistry::new().unwrap();
        let metrics = registry.collector();
        let (mut executor, _rx) =
            Executor::new(Arc::new(StuckProber), config(2, 10), Some(metrics.clone())).unwrap();

        for id in ["a", "b", "c"] {
            executor.dispatch(target(id, Duration::from_secs(60)), 1);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(metrics.probes_in_flight.get(), 2);

        assert_eq!(executor.abort_all(), 3);
        // aborted tasks drop at their next poll
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(metrics.probes_in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let (mut executor, mut rx) =
            Executor::new(Arc::new(PanickingProber), config(2, 10), None).unwrap();

        executor.dispatch(target("boom", Duration::from_secs(1)), 1);
        executor.dispatch(target("fine", Duration::from_secs(1)), 1);
        let mut completions = collect(&mut rx, 2).await;
        completions.sort_by(|a, b| a.result.target_id.cmp(&b.result.target_id));

        assert_eq!(completions[0].result.outcome, Outcome::Skipped);
        assert_eq!(completions[1].result.outcome, Outcome::Success);
        assert_eq!(executor.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_reported_as_timeout() {
        let (mut executor, mut rx) =
            Executor::new(Arc::new(StuckProber), config(1, 10), None).unwrap();

        executor.dispatch(target("stuck", Duration::from_secs(2)), 1);
        let completion = rx.recv().await.unwrap();

        assert_eq!(completion.result.outcome, Outcome::Timeout);
        assert_eq!(executor.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reports_cancelled() {
        let prober = Arc::new(SlowProber::new(Duration::from_secs(5)));
        let (mut executor, mut rx) = Executor::new(prober, config(2, 10), None).unwrap();

        for id in ["a", "b", "c"] {
            executor.dispatch(target(id, Duration::from_secs(10)), 1);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.cancel();

        let completions = collect(&mut rx, 3).await;
        assert!(completions
            .iter()
            .all(|c| c.result.outcome == Outcome::Cancelled));

        executor.dispatch(target("late", Duration::from_secs(10)), 2);
        assert_eq!(rx.recv().await.unwrap().result.outcome, Outcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_unresponsive_probe_after_grace() {
        let (mut executor, mut rx) =
            Executor::new(Arc::new(StuckProber), config(1, 10), None).unwrap();

        executor.dispatch(target("stuck", Duration::from_secs(60)), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled_at = Instant::now();
        executor.cancel();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.result.outcome, Outcome::Cancelled);
        assert!(cancelled_at.elapsed() <= Duration::from_millis(600));
    }
}
