//! Rolling round-trip time estimate.
//!
//! Deliberately not RFC 6298 / Jacobson-Karels smoothing: the legacy
//! client/server instead folds each new sample in at a fixed 2:1 weight
//! against the running estimate, so that's what this reproduces.

use std::time::Duration;

/// Starting estimate used before the first real sample arrives.
const INITIAL_ESTIMATE_MS: f64 = 500.0;

/// A single rolling ping estimate, shared by a connection's keep-alive
/// pings and by its per-stream retransmit timers.
#[derive(Debug, Clone, Copy)]
pub struct RollingPing {
    estimate_ms: f64,
    min_ms: f64,
    max_ms: f64,
    last_ms: f64,
    sample_count: u64,
}

impl Default for RollingPing {
    fn default() -> Self {
        Self {
            estimate_ms: INITIAL_ESTIMATE_MS,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            last_ms: INITIAL_ESTIMATE_MS,
            sample_count: 0,
        }
    }
}

impl RollingPing {
    /// Creates an estimator seeded at the default 500ms starting point.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a fresh round-trip sample: `(rolling * 2 + sample) / 3`.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.estimate_ms = (self.estimate_ms * 2.0 + sample_ms) / 3.0;
        self.last_ms = sample_ms;
        self.min_ms = self.min_ms.min(sample_ms);
        self.max_ms = self.max_ms.max(sample_ms);
        self.sample_count += 1;
    }

    /// Current smoothed estimate.
    #[must_use]
    pub fn estimate(&self) -> Duration {
        Duration::from_secs_f64(self.estimate_ms.max(0.0) / 1000.0)
    }

    /// Most recent raw sample.
    #[must_use]
    pub fn last(&self) -> Duration {
        Duration::from_secs_f64(self.last_ms.max(0.0) / 1000.0)
    }

    /// Smallest sample observed so far, or `None` before the first sample.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.sample_count > 0).then(|| Duration::from_secs_f64(self.min_ms / 1000.0))
    }

    /// Largest sample observed so far, or `None` before the first sample.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.sample_count > 0).then(|| Duration::from_secs_f64(self.max_ms / 1000.0))
    }

    /// How many samples have been folded in.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}
