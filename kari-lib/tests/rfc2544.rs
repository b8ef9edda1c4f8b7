use kari_lib::rfc2544::{
    HarnessOptions, Rfc2544Harness, TestKind, TestStatus, TrialCounters, TrialLink,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A deterministic link that forwards losslessly up to `capacity_mbps` and
/// proportionally drops above it.
struct SyntheticLink {
    capacity_mbps: f64,
    burst_limit: u64,
    trials: AtomicUsize,
}

impl SyntheticLink {
    fn new(capacity_mbps: f64, burst_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity_mbps,
            burst_limit,
            trials: AtomicUsize::new(0),
        })
    }
}

impl TrialLink for SyntheticLink {
    fn run_trial(&self, _frame_size: usize, rate_mbps: f64, _duration: Duration) -> TrialCounters {
        self.trials.fetch_add(1, Ordering::Relaxed);
        let tx = 100_000u64;
        let rx = if rate_mbps <= self.capacity_mbps {
            tx
        } else {
            (tx as f64 * self.capacity_mbps / rate_mbps) as u64
        };
        TrialCounters { tx, rx }
    }

    fn measure_latency(&self, _frame_size: usize, count: usize, _interval: Duration) -> Vec<f64> {
        (0..count).map(|i| 0.5 + (i % 10) as f64 * 0.1).collect()
    }

    fn burst(&self, _frame_size: usize, count: usize) -> TrialCounters {
        let tx = count as u64;
        let rx = tx.min(self.burst_limit);
        TrialCounters { tx, rx }
    }
}

fn fast_options() -> HarnessOptions {
    HarnessOptions {
        frame_sizes: vec![64],
        trial_duration: Duration::from_millis(1),
        latency_interval: Duration::ZERO,
        max_bisect_iterations: 32,
    }
}

#[test]
fn throughput_bisection_converges_on_capacity() {
    let link = SyntheticLink::new(400.0, u64::MAX);
    let harness = Rfc2544Harness::new(link, 1_000.0, Arc::new(AtomicBool::new(false)))
        .with_options(fast_options());
    let report = harness.run("p1", &[TestKind::Throughput]);
    assert_eq!(report.profile, "p1");
    assert_eq!(report.throughput.len(), 1);
    let result = &report.throughput[0];
    assert_eq!(result.status, TestStatus::Ok);
    assert!(
        (result.max_rate_mbps - 400.0).abs() <= 0.2,
        "converged at {}",
        result.max_rate_mbps
    );
}

#[test]
fn cancelled_run_reports_aborted() {
    let link = SyntheticLink::new(400.0, u64::MAX);
    let cancel = Arc::new(AtomicBool::new(true));
    let harness = Rfc2544Harness::new(link, 1_000.0, cancel).with_options(fast_options());
    let report = harness.run("p1", &[TestKind::Throughput, TestKind::Latency]);
    assert_eq!(report.throughput[0].status, TestStatus::Aborted);
    assert_eq!(report.latency[0].status, TestStatus::Aborted);
}

#[test]
fn dead_link_is_inconclusive() {
    struct DeadLink;
    impl TrialLink for DeadLink {
        fn run_trial(&self, _: usize, _: f64, _: Duration) -> TrialCounters {
            TrialCounters::default()
        }
        fn measure_latency(&self, _: usize, _: usize, _: Duration) -> Vec<f64> {
            Vec::new()
        }
        fn burst(&self, _: usize, _: usize) -> TrialCounters {
            TrialCounters::default()
        }
    }
    let harness = Rfc2544Harness::new(
        Arc::new(DeadLink),
        1_000.0,
        Arc::new(AtomicBool::new(false)),
    )
    .with_options(fast_options());
    let report = harness.run("p1", &[TestKind::Throughput, TestKind::Latency]);
    assert_eq!(report.throughput[0].status, TestStatus::Inconclusive);
    assert_eq!(report.latency[0].status, TestStatus::Inconclusive);
}

#[test]
fn frame_loss_ladder_shape() {
    // Capacity at half the nominal rate: lossless through 50%, lossy above.
    let link = SyntheticLink::new(500.0, u64::MAX);
    let harness = Rfc2544Harness::new(link, 1_000.0, Arc::new(AtomicBool::new(false)))
        .with_options(fast_options());
    let report = harness.run("p1", &[TestKind::FrameLoss]);
    let result = &report.frame_loss[0];
    assert_eq!(result.status, TestStatus::Ok);
    assert_eq!(
        result.loss_at_percent.keys().copied().collect::<Vec<_>>(),
        vec![10, 25, 50, 75, 90, 100]
    );
    assert_eq!(result.loss_at_percent[&10], 0.0);
    assert_eq!(result.loss_at_percent[&50], 0.0);
    assert!((result.loss_at_percent[&100] - 50.0).abs() < 0.1);
    assert!(result.loss_at_percent[&75] > 30.0);
    assert!(result.loss_at_percent[&75] < result.loss_at_percent[&90]);
}

#[test]
fn back_to_back_finds_largest_lossless_burst() {
    let link = SyntheticLink::new(1_000.0, 1_000);
    let harness = Rfc2544Harness::new(link, 1_000.0, Arc::new(AtomicBool::new(false)))
        .with_options(fast_options());
    let report = harness.run("p1", &[TestKind::BackToBack]);
    let result = &report.back_to_back[0];
    assert_eq!(result.status, TestStatus::Ok);
    // Burst doubles from 64: the largest lossless burst under 1000 is 512.
    assert_eq!(result.max_burst, 512);
    assert!((result.avg_burst - 512.0).abs() < f64::EPSILON);
}

#[test]
fn latency_statistics_cover_samples() {
    let link = SyntheticLink::new(1_000.0, u64::MAX);
    let harness = Rfc2544Harness::new(link, 1_000.0, Arc::new(AtomicBool::new(false)))
        .with_options(fast_options());
    let report = harness.run("p1", &[TestKind::Latency]);
    let result = &report.latency[0];
    assert_eq!(result.status, TestStatus::Ok);
    assert!((result.min_ms - 0.5).abs() < 1e-9);
    assert!((result.max_ms - 1.4).abs() < 1e-9);
    assert!(result.avg_ms > result.min_ms && result.avg_ms < result.max_ms);
}

#[test]
fn every_frame_size_is_covered() {
    let link = SyntheticLink::new(400.0, u64::MAX);
    let mut opts = fast_options();
    opts.frame_sizes = kari_lib::rfc2544::FRAME_SIZES.to_vec();
    let harness = Rfc2544Harness::new(link, 1_000.0, Arc::new(AtomicBool::new(false)))
        .with_options(opts);
    let report = harness.run("p1", &[TestKind::Throughput]);
    let sizes: Vec<usize> = report.throughput.iter().map(|r| r.frame_size).collect();
    assert_eq!(sizes, kari_lib::rfc2544::FRAME_SIZES.to_vec());
}
