use std::time::{Duration, Instant};

/// Byte-cost token bucket gating emission under a bandwidth cap.
///
/// Capacity and refill are both `cap_bps / 8` bytes per second, so the bucket
/// holds at most one second of traffic.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bps: u64) -> Self {
        let bytes_per_sec = rate_bps as f64 / 8.0;
        Self {
            capacity: bytes_per_sec,
            tokens: bytes_per_sec,
            refill_per_sec: bytes_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Deducts `cost` bytes. Returns how long the caller must wait for the
    /// deficit to refill, when the balance went negative.
    pub fn consume(&mut self, cost: usize) -> Option<Duration> {
        self.consume_at(cost, Instant::now())
    }

    pub fn consume_at(&mut self, cost: usize, now: Instant) -> Option<Duration> {
        self.refill(now);
        self.tokens -= cost as f64;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.refill_per_sec))
        }
    }
}
