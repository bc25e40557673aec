// tests/common/mod.rs
//! Shared utilities for monitor integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use network_monitor::config::Settings;
use network_monitor::probe::{Outcome, ProbeContext, ProbeResult, Prober};
use network_monitor::registry::Target;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn settings() -> Settings {
    Settings {
        max_concurrency: 8,
        failure_threshold: 3,
        backoff_factor: 2,
        backoff_cap: 8,
        max_interval_secs: 300,
        latency_window: 8,
        max_pending: 64,
        drain_timeout_ms: 1_000,
        grace_ms: 500,
        jitter_ms: 0,
    }
}

pub fn target(id: &str, interval_secs: u64, timeout_secs: u64) -> Target {
    Target::tcp(id, "127.0.0.1", 1)
        .with_interval(Duration::from_secs(interval_secs))
        .with_timeout(Duration::from_secs(timeout_secs))
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    peak: AtomicUsize,
    per_target: Mutex<HashMap<String, usize>>,
    per_target_peak: AtomicUsize,
    calls: Mutex<HashMap<String, usize>>,
}

/// Decrements the running counters even when the probe future is dropped.
struct ActiveGuard {
    counters: Arc<Counters>,
    target_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        if let Some(n) = self.counters.per_target.lock().unwrap().get_mut(&self.target_id) {
            *n -= 1;
        }
    }
}

/// Prober with a fixed delay and per-target scripted outcomes (Success once
/// the script runs out). Tracks overall and per-target concurrency.
pub struct FakeProber {
    delay: Duration,
    honour_cancel: bool,
    panic_on: Option<String>,
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    counters: Arc<Counters>,
}

impl FakeProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            honour_cancel: true,
            panic_on: None,
            scripts: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn ignoring_cancellation(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    pub fn panicking_on(mut self, target_id: &str) -> Self {
        self.panic_on = Some(target_id.to_string());
        self
    }

    pub fn script(self, target_id: &str, outcomes: Vec<Outcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(target_id.to_string(), outcomes.into());
        self
    }

    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous probes seen for any single target.
    pub fn per_target_peak(&self) -> usize {
        self.counters.per_target_peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self, target_id: &str) -> usize {
        self.counters
            .calls
            .lock()
            .unwrap()
            .get(target_id)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, target_id: &str) -> ActiveGuard {
        let now = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        let same = {
            let mut per_target = self.counters.per_target.lock().unwrap();
            let n = per_target.entry(target_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.counters.per_target_peak.fetch_max(same, Ordering::SeqCst);

        *self
            .counters
            .calls
            .lock()
            .unwrap()
            .entry(target_id.to_string())
            .or_insert(0) += 1;

        ActiveGuard {
            counters: self.counters.clone(),
            target_id: target_id.to_string(),
        }
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, target: &Target, ctx: &ProbeContext) -> ProbeResult {
        let _guard = self.enter(&target.id);

        if self.panic_on.as_deref() == Some(target.id.as_str()) {
            panic!("fake prober panic for {}", target.id);
        }

        if self.honour_cancel {
            if let Err(e) = ctx.run("connect", tokio::time::sleep(self.delay)).await {
                return ProbeResult::from_error(target.id.clone(), e);
            }
        } else {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&target.id)
            .and_then(|script| script.pop_front())
            .unwrap_or(Outcome::Success);

        if outcome == Outcome::Success {
            ProbeResult::success(target.id.clone(), self.delay)
        } else {
            ProbeResult::failure(target.id.clone(), outcome, "scripted failure")
        }
    }
}

pub fn fake(prober: FakeProber) -> (Arc<FakeProber>, Arc<dyn Prober>) {
    let prober = Arc::new(prober);
    let dyn_prober: Arc<dyn Prober> = prober.clone();
    (prober, dyn_prober)
}
