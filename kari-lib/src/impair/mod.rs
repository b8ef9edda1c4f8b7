//! Stateful impairment pipeline applied between template replication and the
//! interface send.
//!
//! Decision order per frame: drop (Gilbert-Elliott burst model, then uniform
//! loss), duplication, corruption, delay, rate limit. With every knob
//! neutral the pipeline is order-preserving and non-buffering; as soon as
//! latency, jitter, or reordering is active, order is not guaranteed.

pub mod bucket;
pub mod delay;

use rand::{rng, Rng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ImpairmentConfig;
use crate::iface::Interface;
pub use bucket::TokenBucket;
pub use delay::DelayQueue;

/// Soft bound of the delay queue; frames beyond it are dropped and counted.
pub const DELAY_QUEUE_BOUND: usize = 16_384;

/// Downstream consumer of impaired frames.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &[u8]);
}

impl FrameSink for Interface {
    fn deliver(&self, frame: &[u8]) {
        self.send_batch(&[frame]);
    }
}

#[derive(Debug, Default)]
pub struct ImpairmentStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    delayed: AtomicU64,
    duplicated: AtomicU64,
    corrupted: AtomicU64,
    reordered: AtomicU64,
    queue_drops: AtomicU64,
    added_latency_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ImpairmentStatsSnapshot {
    pub processed: u64,
    pub dropped: u64,
    pub delayed: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
    pub queue_drops: u64,
    pub added_latency_ms: u64,
}

impl ImpairmentStats {
    pub fn snapshot(&self) -> ImpairmentStatsSnapshot {
        ImpairmentStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            reordered: self.reordered.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            added_latency_ms: self.added_latency_us.load(Ordering::Relaxed) / 1_000,
        }
    }
}

pub struct ImpairmentPipeline {
    cfg: ImpairmentConfig,
    sink: Arc<dyn FrameSink>,
    stats: Arc<ImpairmentStats>,
    queue: Option<Arc<DelayQueue>>,
    dispatcher: Option<JoinHandle<()>>,
    bucket: Option<Arc<Mutex<TokenBucket>>>,
    burst_remaining: u32,
}

impl ImpairmentPipeline {
    pub fn new(cfg: &ImpairmentConfig, sink: Arc<dyn FrameSink>) -> Self {
        let stats = Arc::new(ImpairmentStats::default());
        let bucket = (cfg.bandwidth_limit_bps > 0)
            .then(|| Arc::new(Mutex::new(TokenBucket::new(cfg.bandwidth_limit_bps))));

        let mut queue = None;
        let mut dispatcher = None;
        if cfg.needs_delay_queue() || cfg.reorder_percent > 0.0 {
            let q = Arc::new(DelayQueue::new(DELAY_QUEUE_BOUND));
            let dispatch_queue = Arc::clone(&q);
            let dispatch_sink = Arc::clone(&sink);
            let dispatch_bucket = bucket.clone();
            dispatcher = Some(std::thread::spawn(move || {
                while let Some(frame) = dispatch_queue.pop_due() {
                    throttle(&dispatch_bucket, frame.len());
                    dispatch_sink.deliver(&frame);
                }
            }));
            queue = Some(q);
        }

        Self {
            cfg: cfg.clone(),
            sink,
            stats,
            queue,
            dispatcher,
            bucket,
            burst_remaining: 0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.cfg.is_passthrough()
    }

    pub fn stats(&self) -> Arc<ImpairmentStats> {
        Arc::clone(&self.stats)
    }

    /// Runs one frame through the pipeline.
    pub fn process(&mut self, frame: &[u8]) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        if self.should_drop() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let duplicate =
            self.cfg.duplicate_percent > 0.0 && percent_hit(self.cfg.duplicate_percent);
        if duplicate {
            self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
        }

        let mut owned: Option<Vec<u8>> = None;
        if self.cfg.corruption_percent > 0.0 && percent_hit(self.cfg.corruption_percent) {
            let mut copy = frame.to_vec();
            if self.cfg.corruption_offset < copy.len() {
                let bit = rng().random_range(0..8u8);
                copy[self.cfg.corruption_offset] ^= 1 << bit;
                self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
            }
            owned = Some(copy);
        }
        let payload: &[u8] = owned.as_deref().unwrap_or(frame);

        let copies = if duplicate { 2 } else { 1 };
        for _ in 0..copies {
            match &self.queue {
                Some(queue) => {
                    let delay = self.draw_delay();
                    self.stats.delayed.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .added_latency_us
                        .fetch_add(delay.as_micros() as u64, Ordering::Relaxed);
                    let due = Instant::now() + delay;
                    let reorder =
                        self.cfg.reorder_percent > 0.0 && percent_hit(self.cfg.reorder_percent);
                    let accepted = if reorder {
                        self.stats.reordered.fetch_add(1, Ordering::Relaxed);
                        queue.push_reordered(due, payload.to_vec(), self.cfg.reorder_gap)
                    } else {
                        queue.push(due, payload.to_vec())
                    };
                    if !accepted {
                        self.stats.queue_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    throttle(&self.bucket, payload.len());
                    self.sink.deliver(payload);
                }
            }
        }
    }

    /// Two-state Markov burst loss, then uniform loss.
    fn should_drop(&mut self) -> bool {
        if self.cfg.burst_loss_percent > 0.0 {
            if self.burst_remaining > 0 {
                self.burst_remaining -= 1;
                return true;
            }
            if percent_hit(self.cfg.burst_loss_percent) {
                self.burst_remaining = self.cfg.burst_loss_length.saturating_sub(1);
                return true;
            }
        }
        self.cfg.loss_percent > 0.0 && percent_hit(self.cfg.loss_percent)
    }

    /// Latency plus uniform jitter, clamped at zero.
    fn draw_delay(&self) -> Duration {
        let mut delay_ms = self.cfg.latency_ms;
        if self.cfg.jitter_ms > 0.0 {
            delay_ms += rng().random_range(-self.cfg.jitter_ms..=self.cfg.jitter_ms);
        }
        Duration::from_secs_f64(delay_ms.max(0.0) / 1_000.0)
    }

    /// Waits for queued delays to drain, closes the queue, and joins the
    /// dispatcher.
    pub fn shutdown(&mut self) {
        if let Some(queue) = &self.queue {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !queue.is_empty() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            queue.close();
        }
        if let Some(join) = self.dispatcher.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ImpairmentPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn percent_hit(percent: f64) -> bool {
    rng().random::<f64>() * 100.0 < percent
}

fn throttle(bucket: &Option<Arc<Mutex<TokenBucket>>>, cost: usize) {
    if let Some(bucket) = bucket {
        let wait = bucket.lock().unwrap().consume(cost);
        if let Some(wait) = wait {
            std::thread::sleep(wait);
        }
    }
}
