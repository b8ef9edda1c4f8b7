//! RFC 2544 benchmark harness: throughput (binary search), latency,
//! frame-loss, and back-to-back tests per frame size.
//!
//! Trial send/receive counts come from interface statistics deltas; the
//! harness never inspects frames except for latency probes, which carry an
//! embedded send timestamp.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::{InterfaceConfig, TrafficProfile};
use crate::iface::{spawn_ingest, timestamp, Interface};
use crate::pool::PacketPool;
use crate::sched::{self, template, worker, ProfileStats};

pub const FRAME_SIZES: [usize; 7] = [64, 128, 256, 512, 1024, 1280, 1518];
/// Loss threshold under which a trial rate counts as sustained.
pub const LOSS_EPSILON_PERCENT: f64 = 0.001;
/// Bisection terminates once the search span is this tight.
pub const BISECT_SPAN_MBPS: f64 = 0.1;
pub const LATENCY_FRAMES: usize = 1_000;
pub const BACK_TO_BACK_TRIALS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Throughput,
    Latency,
    FrameLoss,
    BackToBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Ok,
    Inconclusive,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrialCounters {
    pub tx: u64,
    pub rx: u64,
}

impl TrialCounters {
    pub fn loss_percent(&self) -> f64 {
        if self.tx == 0 {
            return 100.0;
        }
        (self.tx.saturating_sub(self.rx)) as f64 * 100.0 / self.tx as f64
    }
}

/// The device-under-test path a harness drives: emit at a rate and observe
/// what arrived. Implemented over interface pairs in production and by
/// synthetic links in tests.
pub trait TrialLink: Send + Sync {
    fn run_trial(&self, frame_size: usize, rate_mbps: f64, duration: Duration) -> TrialCounters;

    /// Sends `count` timestamped probes at `interval`; returns one-way
    /// latencies in milliseconds.
    fn measure_latency(&self, frame_size: usize, count: usize, interval: Duration) -> Vec<f64>;

    /// Bursts `count` frames back-to-back.
    fn burst(&self, frame_size: usize, count: usize) -> TrialCounters;
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputResult {
    pub frame_size: usize,
    pub max_rate_mbps: f64,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyResult {
    pub frame_size: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameLossResult {
    pub frame_size: usize,
    /// Loss percentage at each tested fraction of the nominal rate.
    pub loss_at_percent: BTreeMap<u32, f64>,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackToBackResult {
    pub frame_size: usize,
    pub max_burst: u64,
    pub avg_burst: f64,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Rfc2544Report {
    pub profile: String,
    pub throughput: Vec<ThroughputResult>,
    pub latency: Vec<LatencyResult>,
    pub frame_loss: Vec<FrameLossResult>,
    pub back_to_back: Vec<BackToBackResult>,
}

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub frame_sizes: Vec<usize>,
    pub trial_duration: Duration,
    pub latency_interval: Duration,
    /// Integration window: bisection iterations before declaring the test
    /// inconclusive.
    pub max_bisect_iterations: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            frame_sizes: FRAME_SIZES.to_vec(),
            trial_duration: Duration::from_secs(60),
            latency_interval: Duration::from_millis(1),
            max_bisect_iterations: 32,
        }
    }
}

pub struct Rfc2544Harness {
    link: Arc<dyn TrialLink>,
    nominal_rate_mbps: f64,
    cancel: Arc<AtomicBool>,
    opts: HarnessOptions,
}

impl Rfc2544Harness {
    pub fn new(link: Arc<dyn TrialLink>, nominal_rate_mbps: f64, cancel: Arc<AtomicBool>) -> Self {
        Self {
            link,
            nominal_rate_mbps,
            cancel,
            opts: HarnessOptions::default(),
        }
    }

    pub fn with_options(mut self, opts: HarnessOptions) -> Self {
        self.opts = opts;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn run(&self, profile: &str, kinds: &[TestKind]) -> Rfc2544Report {
        let mut report = Rfc2544Report {
            profile: profile.to_string(),
            ..Rfc2544Report::default()
        };
        for &size in &self.opts.frame_sizes {
            for kind in kinds {
                match kind {
                    TestKind::Throughput => report.throughput.push(self.throughput_for(size)),
                    TestKind::Latency => report.latency.push(self.latency_for(size)),
                    TestKind::FrameLoss => report.frame_loss.push(self.frame_loss_for(size)),
                    TestKind::BackToBack => report.back_to_back.push(self.back_to_back_for(size)),
                }
            }
        }
        report
    }

    /// Bisects [0, nominal] for the highest rate whose loss stays under the
    /// epsilon.
    fn throughput_for(&self, frame_size: usize) -> ThroughputResult {
        let mut lo = 0.0f64;
        let mut hi = self.nominal_rate_mbps;
        let mut iterations = 0usize;
        while hi - lo > BISECT_SPAN_MBPS {
            if self.cancelled() {
                return ThroughputResult {
                    frame_size,
                    max_rate_mbps: lo,
                    status: TestStatus::Aborted,
                };
            }
            iterations += 1;
            if iterations > self.opts.max_bisect_iterations {
                return ThroughputResult {
                    frame_size,
                    max_rate_mbps: lo,
                    status: TestStatus::Inconclusive,
                };
            }
            let trial_rate = (lo + hi) / 2.0;
            let counters = self
                .link
                .run_trial(frame_size, trial_rate, self.opts.trial_duration);
            if counters.tx == 0 {
                return ThroughputResult {
                    frame_size,
                    max_rate_mbps: lo,
                    status: TestStatus::Inconclusive,
                };
            }
            if counters.loss_percent() <= LOSS_EPSILON_PERCENT {
                lo = trial_rate;
            } else {
                hi = trial_rate;
            }
        }
        info!(frame_size, max_rate_mbps = lo, "throughput search converged");
        ThroughputResult {
            frame_size,
            max_rate_mbps: lo,
            status: TestStatus::Ok,
        }
    }

    fn latency_for(&self, frame_size: usize) -> LatencyResult {
        if self.cancelled() {
            return LatencyResult {
                frame_size,
                min_ms: 0.0,
                avg_ms: 0.0,
                max_ms: 0.0,
                status: TestStatus::Aborted,
            };
        }
        let samples =
            self.link
                .measure_latency(frame_size, LATENCY_FRAMES, self.opts.latency_interval);
        if samples.is_empty() {
            return LatencyResult {
                frame_size,
                min_ms: 0.0,
                avg_ms: 0.0,
                max_ms: 0.0,
                status: TestStatus::Inconclusive,
            };
        }
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        LatencyResult {
            frame_size,
            min_ms: min,
            avg_ms: avg,
            max_ms: max,
            status: TestStatus::Ok,
        }
    }

    fn frame_loss_for(&self, frame_size: usize) -> FrameLossResult {
        let mut loss_at_percent = BTreeMap::new();
        for pct in [10u32, 25, 50, 75, 90, 100] {
            if self.cancelled() {
                return FrameLossResult {
                    frame_size,
                    loss_at_percent,
                    status: TestStatus::Aborted,
                };
            }
            let rate = self.nominal_rate_mbps * f64::from(pct) / 100.0;
            let counters = self.link.run_trial(frame_size, rate, self.opts.trial_duration);
            loss_at_percent.insert(pct, counters.loss_percent());
        }
        FrameLossResult {
            frame_size,
            loss_at_percent,
            status: TestStatus::Ok,
        }
    }

    /// Grows the burst until loss appears; reports the largest lossless burst
    /// and the average over the trials.
    fn back_to_back_for(&self, frame_size: usize) -> BackToBackResult {
        let mut lossless: Vec<u64> = Vec::new();
        for _ in 0..BACK_TO_BACK_TRIALS {
            if self.cancelled() {
                return BackToBackResult {
                    frame_size,
                    max_burst: lossless.iter().copied().max().unwrap_or(0),
                    avg_burst: average(&lossless),
                    status: TestStatus::Aborted,
                };
            }
            let mut burst = 64usize;
            let mut largest = 0u64;
            loop {
                let counters = self.link.burst(frame_size, burst);
                if counters.tx > 0 && counters.rx == counters.tx {
                    largest = counters.tx;
                    if burst >= 1 << 20 {
                        break;
                    }
                    burst *= 2;
                } else {
                    break;
                }
            }
            lossless.push(largest);
        }
        BackToBackResult {
            frame_size,
            max_burst: lossless.iter().copied().max().unwrap_or(0),
            avg_burst: average(&lossless),
            status: TestStatus::Ok,
        }
    }
}

fn average(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

/// Production [`TrialLink`] over a source/destination interface pair; counts
/// come from the interfaces' statistics snapshots.
pub struct InterfaceTrialLink {
    pub profile: TrafficProfile,
    pub src_cfg: InterfaceConfig,
    pub dst_cfg: InterfaceConfig,
    pub src: Arc<Interface>,
    pub dst: Arc<Interface>,
    pub pool: Arc<PacketPool>,
}

impl InterfaceTrialLink {
    fn trial_profile(&self, frame_size: usize, rate_mbps: f64) -> TrafficProfile {
        let mut profile = self.profile.clone();
        profile.packet_size = frame_size;
        profile.bandwidth_mbps = rate_mbps;
        profile.impairments = Default::default();
        profile.packet_size = profile.packet_size.max(template::min_frame_len(&profile));
        profile
    }
}

impl TrialLink for InterfaceTrialLink {
    fn run_trial(&self, frame_size: usize, rate_mbps: f64, duration: Duration) -> TrialCounters {
        let profile = self.trial_profile(frame_size, rate_mbps);
        let Ok(frame) = template::build_template(&profile, &self.src_cfg, &self.dst_cfg) else {
            return TrialCounters::default();
        };
        let tx_before = self.src.stats().snapshot();
        let rx_before = self.dst.stats().snapshot();

        let drain = spawn_ingest(Arc::clone(&self.dst), |_| {});
        let stats = Arc::new(ProfileStats::default());
        let handle = worker::spawn(
            profile,
            Arc::clone(&self.src),
            Arc::clone(&self.pool),
            stats,
            Arc::new(AtomicBool::new(false)),
            frame,
        );
        std::thread::sleep(duration);
        handle.stop();
        // Let stragglers arrive before reading the receive side.
        std::thread::sleep(Duration::from_millis(200));
        drain.stop();

        let tx_after = self.src.stats().snapshot();
        let rx_after = self.dst.stats().snapshot();
        TrialCounters {
            tx: tx_after.tx_frames - tx_before.tx_frames,
            rx: rx_after.rx_frames - rx_before.rx_frames,
        }
    }

    fn measure_latency(&self, frame_size: usize, count: usize, interval: Duration) -> Vec<f64> {
        let profile = self.trial_profile(frame_size, self.profile.bandwidth_mbps);
        let Ok(mut frame) = template::build_template(&profile, &self.src_cfg, &self.dst_cfg)
        else {
            return Vec::new();
        };
        let ts_offset = sched::encap_overhead(&profile);
        if frame.len() < ts_offset + 8 {
            return Vec::new();
        }

        let mut samples = Vec::with_capacity(count);
        let mut rx_buf = [0u8; 2048];
        for _ in 0..count {
            let sent_ns = timestamp::monotonic_ns();
            frame[ts_offset..ts_offset + 8].copy_from_slice(&sent_ns.to_be_bytes());
            self.src.send_batch(&[&frame]);

            let deadline = Instant::now() + Duration::from_millis(10);
            while Instant::now() < deadline {
                if let Some(n) = self.dst.recv_frame(&mut rx_buf) {
                    if n >= ts_offset + 8
                        && rx_buf[ts_offset..ts_offset + 8] == sent_ns.to_be_bytes()
                    {
                        let rx_ns = timestamp::monotonic_ns();
                        samples.push((rx_ns.saturating_sub(sent_ns)) as f64 / 1_000_000.0);
                        break;
                    }
                } else {
                    std::thread::sleep(Duration::from_micros(100));
                }
            }
            std::thread::sleep(interval);
        }
        samples
    }

    fn burst(&self, frame_size: usize, count: usize) -> TrialCounters {
        let profile = self.trial_profile(frame_size, self.profile.bandwidth_mbps);
        let Ok(frame) = template::build_template(&profile, &self.src_cfg, &self.dst_cfg) else {
            return TrialCounters::default();
        };
        let tx_before = self.src.stats().snapshot();
        let rx_before = self.dst.stats().snapshot();

        let drain = spawn_ingest(Arc::clone(&self.dst), |_| {});
        let frames: Vec<&[u8]> = std::iter::repeat(&frame[..]).take(128.min(count)).collect();
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(frames.len());
            self.src.send_batch(&frames[..chunk]);
            remaining -= chunk;
        }
        std::thread::sleep(Duration::from_millis(200));
        drain.stop();

        let tx_after = self.src.stats().snapshot();
        let rx_after = self.dst.stats().snapshot();
        TrialCounters {
            tx: tx_after.tx_frames - tx_before.tx_frames,
            rx: rx_after.rx_frames - rx_before.rx_frames,
        }
    }
}
