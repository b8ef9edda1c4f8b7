//! One pacing worker per enabled profile.
//!
//! The worker replicates its template into pool buffers, pushes batches
//! through the impairment pipeline to the interface, and paces emission on
//! the monotonic clock: sleep-then-spin below 1k pps, pure spin above.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::TrafficProfile;
use crate::iface::Interface;
use crate::impair::{FrameSink, ImpairmentPipeline, ImpairmentStats};
use crate::pool::PacketPool;

/// Join deadline after which a stuck worker is abandoned.
pub const STOP_DEADLINE: Duration = Duration::from_secs(2);

/// Rate-derived batch size, subject to the profile's ceiling.
pub fn batch_size_for(pps: f64, ceiling: usize) -> usize {
    let by_rate = if pps > 100_000.0 {
        128
    } else if pps > 10_000.0 {
        64
    } else {
        32
    };
    by_rate.min(ceiling.max(1))
}

#[derive(Debug, Default)]
pub struct ProfileStats {
    emitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProfileStatsSnapshot {
    pub emitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ProfileStats {
    pub fn snapshot(&self) -> ProfileStatsSnapshot {
        ProfileStatsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerHandle {
    name: String,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    impair_stats: Arc<ImpairmentStats>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn impair_stats(&self) -> Arc<ImpairmentStats> {
        Arc::clone(&self.impair_stats)
    }

    /// Cooperative stop: the worker exits at the next batch boundary; after
    /// [`STOP_DEADLINE`] it is abandoned.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let deadline = Instant::now() + STOP_DEADLINE;
            while !join.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                warn!(worker = %self.name, "worker missed stop deadline, detaching");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Spawns the pacing thread for one enabled profile.
pub fn spawn(
    profile: TrafficProfile,
    iface: Arc<Interface>,
    pool: Arc<PacketPool>,
    stats: Arc<ProfileStats>,
    impairments_enabled: Arc<AtomicBool>,
    template: Vec<u8>,
) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let name = profile.name.clone();

    let sink: Arc<dyn FrameSink> = Arc::clone(&iface) as Arc<dyn FrameSink>;
    let mut pipeline = ImpairmentPipeline::new(&profile.impairments, sink);
    let impair_stats = pipeline.stats();

    let join = std::thread::spawn(move || {
        let frame_bits = (template.len() * 8) as f64;
        let pps = profile.bandwidth_mbps * 1_000_000.0 / frame_bits;
        if !pps.is_finite() || pps <= 0.0 {
            warn!(profile = %profile.name, "zero packet rate, worker exiting");
            return;
        }
        let interval = Duration::from_nanos((1_000_000_000.0 / pps) as u64);
        let batch = batch_size_for(pps, profile.batch_size);
        let batch_interval = interval * batch as u32;
        info!(
            profile = %profile.name,
            pps = pps as u64,
            batch,
            interval_ns = interval.as_nanos() as u64,
            "traffic worker started"
        );

        let mut next_emit = Instant::now();
        while !stop_flag.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= next_emit {
                let mut handles = Vec::with_capacity(batch);
                for _ in 0..batch {
                    match pool.alloc() {
                        Some(mut handle) => {
                            handle.fill(&template);
                            handles.push(handle);
                        }
                        None => break,
                    }
                }
                let shortfall = batch - handles.len();
                stats.emitted.fetch_add(handles.len() as u64, Ordering::Relaxed);
                stats.failed.fetch_add(shortfall as u64, Ordering::Relaxed);

                let impaired =
                    impairments_enabled.load(Ordering::Relaxed) && !pipeline.is_passthrough();
                if impaired {
                    for handle in &handles {
                        pipeline.process(handle);
                    }
                    stats
                        .succeeded
                        .fetch_add(handles.len() as u64, Ordering::Relaxed);
                } else {
                    let frames: Vec<&[u8]> = handles.iter().map(|h| &h[..]).collect();
                    let accepted = iface.send_batch(&frames);
                    stats.succeeded.fetch_add(accepted as u64, Ordering::Relaxed);
                    stats
                        .failed
                        .fetch_add((frames.len() - accepted) as u64, Ordering::Relaxed);
                }
                drop(handles);

                next_emit += batch_interval;
                if now > next_emit {
                    // Too far behind: rebase instead of bursting to catch up.
                    next_emit = now + batch_interval;
                }
            } else if pps < 1_000.0 {
                let wait = next_emit.duration_since(now);
                if wait > Duration::from_millis(1) {
                    std::thread::sleep(wait - Duration::from_millis(1));
                }
                // Busy-poll the final interval for precision.
            } else {
                std::hint::spin_loop();
            }
        }
        pipeline.shutdown();
        info!(profile = %profile.name, "traffic worker stopped");
    });

    WorkerHandle {
        name,
        stop,
        join: Some(join),
        impair_stats,
    }
}
