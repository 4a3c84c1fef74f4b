use std::collections::VecDeque;

use crate::clock::{Millis, duration_millis};
use crate::config::PhiAccrualConfig;

use super::Sample;

/// Phi-accrual failure detector.
///
/// Keeps a bounded window of inter-arrival intervals and fits a normal distribution over
/// them. The suspicion level φ is `-log10` of the probability that a heartbeat arrives later
/// than the silence observed so far. Sums are kept as integers so a long-lived window never
/// drifts.
#[derive(Debug, Clone)]
pub struct PhiAccrualDetector {
    threshold: f64,
    max_samples: usize,
    min_std_deviation: f64,
    acceptable_pause: f64,
    first_estimate: f64,
    history: VecDeque<Sample>,
    interval_sum: i64,
    interval_square_sum: i128,
    last_arrival: Option<Millis>,
    suspected: bool,
}

impl PhiAccrualDetector {
    /// Creates an empty detector.
    #[must_use]
    pub fn new(config: &PhiAccrualConfig) -> Self {
        Self {
            threshold: config.threshold,
            max_samples: config.max_samples.max(1),
            min_std_deviation: duration_millis(config.min_std_deviation) as f64,
            acceptable_pause: duration_millis(config.acceptable_pause) as f64,
            first_estimate: duration_millis(config.first_heartbeat_estimate) as f64,
            history: VecDeque::with_capacity(config.max_samples.min(1_024)),
            interval_sum: 0,
            interval_square_sum: 0,
            last_arrival: None,
            suspected: false,
        }
    }

    /// Appends a sample. The delay of the very first sample carries no information and is
    /// ignored; only delays that follow an earlier arrival enter the window.
    pub fn record(&mut self, arrival: Millis, delay: Millis) {
        self.suspected = false;
        let Some(previous) = self.last_arrival else {
            self.last_arrival = Some(arrival);
            return;
        };
        self.last_arrival = Some(previous.max(arrival));

        let delay = delay.max(0);
        if self.history.len() == self.max_samples {
            if let Some(evicted) = self.history.pop_front() {
                self.interval_sum -= evicted.delay;
                self.interval_square_sum -= i128::from(evicted.delay) * i128::from(evicted.delay);
            }
        }
        self.history.push_back(Sample { arrival, delay });
        self.interval_sum += delay;
        self.interval_square_sum += i128::from(delay) * i128::from(delay);
    }

    /// Number of intervals in the window.
    #[must_use]
    pub fn interval_count(&self) -> usize {
        self.history.len()
    }

    /// Samples currently in the window, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.history.iter()
    }

    /// Time of the most recent arrival.
    #[must_use]
    pub const fn last_arrival(&self) -> Option<Millis> {
        self.last_arrival
    }

    /// Mean inter-arrival interval in milliseconds.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.history.is_empty() {
            return self.first_estimate;
        }
        self.interval_sum as f64 / self.history.len() as f64
    }

    /// Standard deviation of the interval window in milliseconds.
    #[must_use]
    pub fn std_deviation(&self) -> f64 {
        if self.history.len() < 2 {
            return self.first_estimate / 4.0;
        }
        let count = self.history.len() as f64;
        let mean = self.mean();
        let variance = (self.interval_square_sum as f64 / count) - mean * mean;
        variance.max(0.0).sqrt()
    }

    /// Current suspicion level. Zero when no arrival has been recorded yet.
    #[must_use]
    pub fn phi(&self, now: Millis) -> f64 {
        let Some(last) = self.last_arrival else {
            return 0.0;
        };
        let elapsed = (now - last).max(0) as f64;
        let mean = self.mean() + self.acceptable_pause;
        let std_deviation = self.std_deviation().max(self.min_std_deviation).max(f64::EPSILON);
        phi(elapsed, mean, std_deviation)
    }

    /// Flags the peer as suspect until the next recorded sample.
    pub fn suspect(&mut self) {
        self.suspected = true;
    }

    /// Returns `true` once φ exceeds the configured threshold.
    #[must_use]
    pub fn should_convict(&self, now: Millis) -> bool {
        if self.last_arrival.is_none() {
            return false;
        }
        self.suspected || self.phi(now) > self.threshold
    }
}

/// `-log10(P(X > elapsed))` for `X ~ N(mean, std_deviation)`, using the logistic
/// approximation of the normal CDF.
fn phi(elapsed: f64, mean: f64, std_deviation: f64) -> f64 {
    let y = (elapsed - mean) / std_deviation;
    let e = (-y * (1.5976 + 0.070_566 * y * y)).exp();
    let p_later = if elapsed > mean {
        e / (1.0 + e)
    } else {
        1.0 - 1.0 / (1.0 + e)
    };
    -p_later.log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn config() -> PhiAccrualConfig {
        PhiAccrualConfig {
            threshold: 8.0,
            max_samples: 1_000,
            min_std_deviation: Duration::from_millis(100),
            acceptable_pause: Duration::ZERO,
            first_heartbeat_estimate: Duration::from_millis(500),
        }
    }

    #[test]
    fn jittered_stream_then_long_silence() {
        let mut detector = PhiAccrualDetector::new(&config());
        let mut rng = SmallRng::seed_from_u64(666);
        let mut now: Millis = 1_000_000;
        let mut last_jitter = 0;
        for _ in 0..950 {
            last_jitter = rng.gen_range(-100..=100);
            let delay = 500 + last_jitter;
            now += delay;
            detector.record(now, delay);
        }

        assert!(!detector.should_convict(now + last_jitter.abs()));
        assert!(!detector.should_convict(now + 573));
        assert!(detector.should_convict(now + 30_000));
    }

    #[test]
    fn never_convicts_without_samples() {
        let detector = PhiAccrualDetector::new(&config());
        assert!(!detector.should_convict(i64::MAX / 2));
        assert!(detector.phi(10_000).abs() < f64::EPSILON);
    }

    #[test]
    fn first_delay_is_ignored() {
        let mut detector = PhiAccrualDetector::new(&config());
        detector.record(1_000, 9_999);
        assert_eq!(detector.interval_count(), 0);
        detector.record(1_500, 500);
        assert_eq!(detector.interval_count(), 1);
        assert!((detector.mean() - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn window_is_bounded() {
        let mut cfg = config();
        cfg.max_samples = 4;
        let mut detector = PhiAccrualDetector::new(&cfg);
        let mut now = 0;
        detector.record(now, 0);
        for delay in [100, 100, 100, 100, 900, 900, 900, 900] {
            now += delay;
            detector.record(now, delay);
        }
        assert_eq!(detector.interval_count(), 4);
        assert!((detector.mean() - 900.0).abs() < f64::EPSILON);
        assert_eq!(detector.samples().next().map(|s| s.arrival), Some(1_300));
    }

    #[test]
    fn phi_grows_with_silence() {
        let mut detector = PhiAccrualDetector::new(&config());
        let mut now = 0;
        detector.record(now, 0);
        for _ in 0..20 {
            now += 500;
            detector.record(now, 500);
        }
        let early = detector.phi(now + 400);
        let late = detector.phi(now + 900);
        assert!(late > early);
    }

    #[test]
    fn suspicion_flag_clears_on_record() {
        let mut detector = PhiAccrualDetector::new(&config());
        detector.record(0, 0);
        detector.suspect();
        assert!(detector.should_convict(1));
        detector.record(500, 500);
        assert!(!detector.should_convict(501));
    }
}
