// src/metrics/collector.rs
use crate::probe::{Outcome, ProbeResult};
use crate::state::Status;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Probe metrics
    pub probes_total: IntCounterVec,
    pub probe_duration_seconds: HistogramVec,
    pub probes_in_flight: IntGauge,
    pub probes_skipped_total: IntCounterVec,

    // Target metrics
    pub target_up: IntGaugeVec,
    pub target_backoff_multiplier: IntGaugeVec,
    pub targets_total: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let probes_total = IntCounterVec::new(
            Opts::new("netmon_probes_total", "Completed probes by outcome"),
            &["target", "outcome"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let probe_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "netmon_probe_duration_seconds",
                "Latency of successful probes in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["target"],
        )?;
        registry.register(Box::new(probe_duration_seconds.clone()))?;

        let probes_in_flight =
            IntGauge::new("netmon_probes_in_flight", "Probes currently running")?;
        registry.register(Box::new(probes_in_flight.clone()))?;

        let probes_skipped_total = IntCounterVec::new(
            Opts::new(
                "netmon_probes_skipped_total",
                "Probes that could not start this cycle",
            ),
            &["target"],
        )?;
        registry.register(Box::new(probes_skipped_total.clone()))?;

        let target_up = IntGaugeVec::new(
            Opts::new(
                "netmon_target_up",
                "Target status (1=up, 0=down, -1=unknown)",
            ),
            &["target"],
        )?;
        registry.register(Box::new(target_up.clone()))?;

        let target_backoff_multiplier = IntGaugeVec::new(
            Opts::new(
                "netmon_target_backoff_multiplier",
                "Current probe interval multiplier",
            ),
            &["target"],
        )?;
        registry.register(Box::new(target_backoff_multiplier.clone()))?;

        let targets_total = IntGauge::new("netmon_targets_total", "Monitored targets")?;
        registry.register(Box::new(targets_total.clone()))?;

        Ok(Self {
            probes_total,
            probe_duration_seconds,
            probes_in_flight,
            probes_skipped_total,
            target_up,
            target_backoff_multiplier,
            targets_total,
        })
    }

    pub fn record_probe(&self, result: &ProbeResult) {
        let target = result.target_id.as_str();
        self.probes_total
            .with_label_values(&[target, result.outcome.as_str()])
            .inc();

        if result.outcome == Outcome::Skipped {
            self.probes_skipped_total.with_label_values(&[target]).inc();
        }

        if let Some(latency) = result.latency {
            self.probe_duration_seconds
                .with_label_values(&[target])
                .observe(latency.as_secs_f64());
        }
    }

    pub fn update_target(&self, target: &str, status: Status, backoff_multiplier: u32) {
        let value = match status {
            Status::Up => 1,
            Status::Down => 0,
            Status::Unknown => -1,
        };
        self.target_up.with_label_values(&[target]).set(value);
        self.target_backoff_multiplier
            .with_label_values(&[target])
            .set(backoff_multiplier as i64);
    }

    pub fn remove_target(&self, target: &str) {
        let _ = self.target_up.remove_label_values(&[target]);
        let _ = self.target_backoff_multiplier.remove_label_values(&[target]);
    }

    pub fn probe_started(&self) {
        self.probes_in_flight.inc();
    }

    pub fn probe_finished(&self) {
        self.probes_in_flight.dec();
    }

    pub fn set_target_count(&self, total: usize) {
        self.targets_total.set(total as i64);
    }
}
