// src/state/window.rs
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-capacity FIFO of recent latencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Duration> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Nearest-rank percentile, `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let p = p.clamp(0.0, 100.0);
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }
}

impl Serialize for LatencyWindow {
    /// Samples as milliseconds, oldest first.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.samples.len()))?;
        for sample in &self.samples {
            seq.serialize_element(&(sample.as_secs_f64() * 1000.0))?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut window = LatencyWindow::new(3);
        for n in 1..=5 {
            window.push(ms(n));
        }

        let kept: Vec<_> = window.iter().copied().collect();
        assert_eq!(kept, vec![ms(3), ms(4), ms(5)]);
        assert_eq!(window.latest(), Some(ms(5)));
    }

    #[test]
    fn test_mean_and_percentile() {
        let mut window = LatencyWindow::new(10);
        assert!(window.mean().is_none());
        assert!(window.percentile(50.0).is_none());

        for n in [10, 20, 30, 40] {
            window.push(ms(n));
        }

        assert_eq!(window.mean(), Some(ms(25)));
        assert_eq!(window.percentile(50.0), Some(ms(20)));
        assert_eq!(window.percentile(95.0), Some(ms(40)));
        assert_eq!(window.percentile(0.0), Some(ms(10)));
    }

    #[test]
    fn test_serializes_as_millis() {
        let mut window = LatencyWindow::new(2);
        window.push(Duration::from_micros(1500));
        assert_eq!(serde_json::to_string(&window).unwrap(), "[1.5]");
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..64, samples in proptest::collection::vec(0u64..10_000, 0..256)) {
            let mut window = LatencyWindow::new(capacity);
            for s in &samples {
                window.push(ms(*s));
                prop_assert!(window.len() <= capacity);
            }

            let expected: Vec<Duration> = samples
                .iter()
                .skip(samples.len().saturating_sub(capacity))
                .map(|s| ms(*s))
                .collect();
            let kept: Vec<Duration> = window.iter().copied().collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
