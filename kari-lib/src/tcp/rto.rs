use std::time::Duration;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const RTO_MIN: f64 = 1.0;
const RTO_MAX: f64 = 60.0;

/// Jacobson/Karels retransmission-timeout estimator.
///
/// The RTO is clamped to [1 s, 60 s] after every update and doubles on each
/// timeout until fresh samples arrive.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RtoEstimator {
    pub fn new() -> Self {
        Self {
            srtt: None,
            rttvar: 0.0,
            rto: 1.0,
        }
    }

    /// Feeds one round-trip sample.
    pub fn observe(&mut self, rtt: Duration) {
        let rtt = rtt.as_secs_f64();
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2.0;
            }
            Some(srtt) => {
                self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (srtt - rtt).abs();
                self.srtt = Some((1.0 - ALPHA) * srtt + ALPHA * rtt);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + 4.0 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    /// Exponential backoff applied on a retransmission timeout.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).clamp(RTO_MIN, RTO_MAX);
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.rto)
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt.map(Duration::from_secs_f64)
    }
}
