//! See [`RttEstimator`].

use std::time::Duration;

use crate::{DEFAULT_RTO, MAX_RTO};

/// Smallest wait the retransmission timer can resolve; RTO never tightens
/// below four times the variance or this, whichever is larger.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(20);

/// Computes the retransmission timeout for a circuit from acknowledgement
/// round-trip samples, per RFC 2988.
///
/// Until the first sample arrives the timeout sits at `default_rto`. The
/// first sample seeds `srtt = r`, `rttvar = r / 2`; each later sample folds
/// in as `rttvar = 3/4·rttvar + 1/4·|srtt − r|`, `srtt = 7/8·srtt + 1/8·r`.
/// After every sample the timeout is recomputed as
/// `clamp(srtt + max(granularity, 4·rttvar), default_rto, max_rto)`.
///
/// [`backoff`](RttEstimator::backoff) implements the retransmission path:
/// the timeout doubles (capped at `max_rto`) and the smoothed state resets,
/// so the next accepted sample re-seeds the estimator. Samples must only be
/// taken from messages that were never retransmitted (Karn's rule); the
/// archive enforces that, not this type.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    default_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    /// Creates an estimator with no samples yet.
    #[must_use]
    pub fn new(default_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: default_rto,
            default_rto,
            max_rto,
        }
    }

    /// Current retransmission timeout.
    #[must_use]
    pub const fn rto(&self) -> Duration {
        self.rto
    }

    /// Current smoothed round-trip estimate; zero before the first sample
    /// and directly after a backoff.
    #[must_use]
    pub const fn srtt(&self) -> Duration {
        self.srtt
    }

    /// Current round-trip variance estimate.
    #[must_use]
    pub const fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Folds in one acknowledgement round-trip sample.
    pub fn sample(&mut self, r: Duration) {
        if self.srtt.is_zero() {
            self.srtt = r;
            self.rttvar = r / 2;
        } else {
            let deviation = if self.srtt > r {
                self.srtt - r
            } else {
                r - self.srtt
            };
            self.rttvar = (3 * self.rttvar + deviation) / 4;
            self.srtt = (7 * self.srtt + r) / 8;
        }
        self.rto = (self.srtt + (4 * self.rttvar).max(TIMER_GRANULARITY))
            .clamp(self.default_rto, self.max_rto);
    }

    /// Doubles the timeout after a retransmission and forgets the smoothed
    /// state, so stale samples cannot drag the timeout back down.
    pub fn backoff(&mut self) {
        self.srtt = Duration::ZERO;
        self.rttvar = Duration::ZERO;
        self.rto = (self.rto * 2).min(self.max_rto);
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_RTO, MAX_RTO)
    }
}
