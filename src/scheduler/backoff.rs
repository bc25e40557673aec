// src/scheduler/backoff.rs
use crate::config::Settings;
use rand::Rng;
use std::time::Duration;

/// Interval stretching for targets that keep failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub factor: u32,
    pub max_multiplier: u32,
    pub max_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            factor: settings.backoff_factor.max(1),
            max_multiplier: settings.backoff_cap.max(1),
            max_interval: settings.max_interval(),
        }
    }

    /// Multiplier after one more consecutive failure.
    pub fn escalate(&self, current: u32) -> u32 {
        current
            .max(1)
            .saturating_mul(self.factor)
            .min(self.max_multiplier)
    }

    /// Effective interval: base * multiplier, capped at `max_interval`.
    /// A base longer than the cap is never shortened.
    pub fn interval(&self, base: Duration, multiplier: u32) -> Duration {
        let stretched = base.saturating_mul(multiplier.max(1));
        stretched.min(self.max_interval.max(base))
    }
}

/// Uniform random offset in `[0, max)` used to spread first probes.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
