// src/monitor/mod.rs
//! Monitoring session: wires registry, scheduler, executor and state store
//! together and runs the main loop on the current tokio runtime.

mod engine;
mod handle;

pub use handle::{DrainReport, MonitorHandle};

use crate::config::{ConfigError, Settings};
use crate::executor::{Executor, ExecutorConfig, ExecutorError};
use crate::metrics::MetricsCollector;
use crate::probe::{Prober, TransportProber};
use crate::registry::{RegistryError, Target, TargetRegistry};
use crate::scheduler::{jitter, BackoffPolicy, Scheduler};
use crate::state::{AggregationPolicy, StateStore};
use engine::{Engine, Shared};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::info;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("no tokio runtime is running")]
    NoRuntime,
    #[error("cannot allocate probe workers: {0}")]
    ResourceExhausted(#[from] ExecutorError),
    #[error(transparent)]
    InvalidSettings(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("monitor loop failed: {0}")]
    EngineFailed(String),
}

pub struct Monitor;

impl Monitor {
    pub fn builder(settings: Settings) -> MonitorBuilder {
        MonitorBuilder::new(settings)
    }

    /// Start monitoring `targets` with the production prober.
    pub fn start(targets: Vec<Target>, settings: Settings) -> Result<MonitorHandle, MonitorError> {
        Self::builder(settings).start(targets)
    }
}

pub struct MonitorBuilder {
    settings: Settings,
    prober: Option<Arc<dyn Prober>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl MonitorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            prober: None,
            metrics: None,
        }
    }

    /// Replace the transport prober (tests, custom checks).
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate settings, seed every target as Unknown and due now (plus
    /// jitter), and spawn the main loop.
    pub fn start(self, targets: Vec<Target>) -> Result<MonitorHandle, MonitorError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;
        self.settings.validate()?;
        validate_targets(&targets)?;

        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(TransportProber::new()));
        let (executor, completions) = Executor::new(
            prober,
            ExecutorConfig::from_settings(&self.settings),
            self.metrics.clone(),
        )?;

        let registry = TargetRegistry::new(targets)?;
        let snapshot = registry.snapshot();

        let backoff = BackoffPolicy::from_settings(&self.settings);
        let state = StateStore::with_targets(
            AggregationPolicy {
                failure_threshold: self.settings.failure_threshold,
                latency_window: self.settings.latency_window,
                backoff,
            },
            snapshot.ids().cloned(),
        );

        let now = Instant::now();
        let mut scheduler = Scheduler::new(backoff);
        for target in snapshot.iter() {
            scheduler.insert(
                target.id.clone(),
                target.interval,
                now + jitter(self.settings.jitter()),
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_target_count(snapshot.len());
            for id in snapshot.ids() {
                metrics.update_target(id, crate::state::Status::Unknown, 1);
            }
        }

        let shared = Arc::new(Shared {
            registry,
            scheduler: Mutex::new(scheduler),
            state,
            wake: Notify::new(),
            metrics: self.metrics,
            jitter: self.settings.jitter(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Engine::new(
            shared.clone(),
            executor,
            completions,
            shutdown_rx,
            self.settings.drain_timeout(),
        );

        info!(
            targets = snapshot.len(),
            max_concurrency = self.settings.max_concurrency,
            failure_threshold = self.settings.failure_threshold,
            "Starting network monitor"
        );

        let task = runtime.spawn(engine.run());
        Ok(MonitorHandle::new(shared, shutdown_tx, task))
    }
}

/// Targets built in code skip config validation; reject the values that
/// would make the loop spin.
pub(crate) fn validate_targets(targets: &[Target]) -> Result<(), ConfigError> {
    for target in targets {
        if target.interval.is_zero() {
            return Err(ConfigError::target(&target.id, "interval must be positive"));
        }
        if target.timeout.is_zero() {
            return Err(ConfigError::target(&target.id, "timeout must be positive"));
        }
    }
    Ok(())
}

/// Stop a running monitor. Same as [`MonitorHandle::stop`].
pub async fn stop(handle: MonitorHandle) -> Result<DrainReport, MonitorError> {
    handle.stop().await
}
