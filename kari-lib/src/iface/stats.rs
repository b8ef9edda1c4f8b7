use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-port counters, updated from the data plane without locks.
#[derive(Debug, Default)]
pub struct IfaceStats {
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    dropped: AtomicU64,
    parse_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct IfaceStatsSnapshot {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub dropped: u64,
    pub parse_errors: u64,
}

impl IfaceStats {
    pub fn add_tx(&self, frames: u64, bytes: u64) {
        self.tx_frames.fetch_add(frames, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rx(&self, frames: u64, bytes: u64) {
        self.rx_frames.fetch_add(frames, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, frames: u64) {
        if frames > 0 {
            self.dropped.fetch_add(frames, Ordering::Relaxed);
        }
    }

    pub fn add_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IfaceStatsSnapshot {
        IfaceStatsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    /// Render counters in Prometheus exposition text format.
    pub fn to_prometheus(&self, name: &str) -> String {
        let snap = self.snapshot();
        format!(
            "kari_tx_frames_total{{interface=\"{name}\"}} {}\n\
             kari_tx_bytes_total{{interface=\"{name}\"}} {}\n\
             kari_rx_frames_total{{interface=\"{name}\"}} {}\n\
             kari_rx_bytes_total{{interface=\"{name}\"}} {}\n\
             kari_dropped_frames_total{{interface=\"{name}\"}} {}\n\
             kari_parse_errors_total{{interface=\"{name}\"}} {}\n",
            snap.tx_frames,
            snap.tx_bytes,
            snap.rx_frames,
            snap.rx_bytes,
            snap.dropped,
            snap.parse_errors,
        )
    }
}
