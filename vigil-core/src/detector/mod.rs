//! Failure detectors consuming heartbeat inter-arrival samples.

/// Exponentially weighted mean/variance detector.
pub mod adaptive;
/// Phi-accrual detector over a bounded interval window.
pub mod phi;

pub use adaptive::AdaptiveDetector;
pub use phi::PhiAccrualDetector;

use crate::clock::Millis;
use crate::config::DetectorConfig;

/// One heartbeat arrival together with the delay since the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Local arrival time.
    pub arrival: Millis,
    /// Inter-arrival delay.
    pub delay: Millis,
}

/// Per-peer failure detector, selected by configuration at construction time.
///
/// Both variants share the same contract: they never convict before the first sample, and
/// they only start estimating intervals once a second sample exists.
#[derive(Debug, Clone)]
pub enum FailureDetector {
    /// Statistical suspicion level over a bounded window.
    PhiAccrual(PhiAccrualDetector),
    /// Smoothed mean plus `k` standard deviations.
    Adaptive(AdaptiveDetector),
}

impl FailureDetector {
    /// Builds the detector variant named by `config`.
    #[must_use]
    pub fn from_config(config: &DetectorConfig) -> Self {
        match config {
            DetectorConfig::Phi(phi) => Self::PhiAccrual(PhiAccrualDetector::new(phi)),
            DetectorConfig::Adaptive(adaptive) => Self::Adaptive(AdaptiveDetector::new(adaptive)),
        }
    }

    /// Appends a sample.
    pub fn record(&mut self, arrival: Millis, delay: Millis) {
        match self {
            Self::PhiAccrual(detector) => detector.record(arrival, delay),
            Self::Adaptive(detector) => detector.record(arrival, delay),
        }
    }

    /// Records an arrival at `now`, deriving the delay from the previous arrival.
    pub fn heartbeat(&mut self, now: Millis) {
        let delay = self.last_arrival().map_or(0, |last| now - last);
        self.record(now, delay);
    }

    /// Forces conviction until the next sample arrives. Has no effect before the first sample.
    pub fn suspect(&mut self) {
        match self {
            Self::PhiAccrual(detector) => detector.suspect(),
            Self::Adaptive(detector) => detector.suspect(),
        }
    }

    /// Whether the peer should be treated as failed at `now`.
    #[must_use]
    pub fn should_convict(&self, now: Millis) -> bool {
        match self {
            Self::PhiAccrual(detector) => detector.should_convict(now),
            Self::Adaptive(detector) => detector.should_convict(now),
        }
    }

    /// Time of the most recent arrival, if any.
    #[must_use]
    pub const fn last_arrival(&self) -> Option<Millis> {
        match self {
            Self::PhiAccrual(detector) => detector.last_arrival(),
            Self::Adaptive(detector) => detector.last_arrival(),
        }
    }

    /// Number of inter-arrival intervals the detector has learned from.
    #[must_use]
    pub fn interval_count(&self) -> usize {
        match self {
            Self::PhiAccrual(detector) => detector.interval_count(),
            Self::Adaptive(detector) => detector.interval_count(),
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn algorithm(&self) -> &'static str {
        match self {
            Self::PhiAccrual(_) => "phi",
            Self::Adaptive(_) => "adaptive",
        }
    }
}
