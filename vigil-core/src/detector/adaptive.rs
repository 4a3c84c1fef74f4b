use crate::clock::{Millis, duration_millis};
use crate::config::AdaptiveConfig;

/// Adaptive failure detector.
///
/// Tracks an exponentially weighted mean and variance of inter-arrival intervals and
/// convicts once the silence exceeds `mean + multiplier * stddev`. Cheaper than phi-accrual
/// and quicker to follow a shift in heartbeat cadence, at the cost of refusing to convict
/// until `min_samples` intervals have been seen.
#[derive(Debug, Clone)]
pub struct AdaptiveDetector {
    smoothing: f64,
    multiplier: f64,
    min_samples: usize,
    min_std_deviation: f64,
    mean: f64,
    variance: f64,
    intervals: usize,
    last_arrival: Option<Millis>,
    suspected: bool,
}

impl AdaptiveDetector {
    /// Creates an empty detector.
    #[must_use]
    pub fn new(config: &AdaptiveConfig) -> Self {
        Self {
            smoothing: config.smoothing.clamp(f64::EPSILON, 1.0),
            multiplier: config.multiplier,
            min_samples: config.min_samples,
            min_std_deviation: duration_millis(config.min_std_deviation) as f64,
            mean: 0.0,
            variance: 0.0,
            intervals: 0,
            last_arrival: None,
            suspected: false,
        }
    }

    /// Folds a sample into the running estimates. The first sample only anchors the arrival
    /// time.
    pub fn record(&mut self, arrival: Millis, delay: Millis) {
        self.suspected = false;
        let Some(previous) = self.last_arrival else {
            self.last_arrival = Some(arrival);
            return;
        };
        self.last_arrival = Some(previous.max(arrival));

        let interval = delay.max(0) as f64;
        if self.intervals == 0 {
            self.mean = interval;
            self.variance = 0.0;
        } else {
            let diff = interval - self.mean;
            let increment = self.smoothing * diff;
            self.mean += increment;
            self.variance = (1.0 - self.smoothing) * (self.variance + diff * increment);
        }
        self.intervals = self.intervals.saturating_add(1);
    }

    /// Number of intervals folded into the estimates.
    #[must_use]
    pub const fn interval_count(&self) -> usize {
        self.intervals
    }

    /// Time of the most recent arrival.
    #[must_use]
    pub const fn last_arrival(&self) -> Option<Millis> {
        self.last_arrival
    }

    /// Smoothed mean interval in milliseconds.
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Smoothed standard deviation, floored at the configured minimum.
    #[must_use]
    pub fn std_deviation(&self) -> f64 {
        self.variance.max(0.0).sqrt().max(self.min_std_deviation)
    }

    /// Silence, in milliseconds, beyond which the peer is convicted.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.mean + self.multiplier * self.std_deviation()
    }

    /// Flags the peer as suspect until the next recorded sample.
    pub fn suspect(&mut self) {
        self.suspected = true;
    }

    /// Returns `true` when the current silence exceeds the adaptive threshold.
    #[must_use]
    pub fn should_convict(&self, now: Millis) -> bool {
        let Some(last) = self.last_arrival else {
            return false;
        };
        if self.suspected {
            return true;
        }
        if self.intervals < self.min_samples.max(1) {
            return false;
        }
        (now - last) as f64 > self.threshold()
    }
}
