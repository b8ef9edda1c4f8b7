//! Per-port send/receive abstraction.
//!
//! Every consumer talks to an [`Interface`] through the same best-effort
//! `send_batch` contract regardless of which backend serves the port.

pub mod accel;
pub mod discover;
pub mod raw;
pub mod stats;
pub mod timestamp;

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{InterfaceConfig, InterfaceType};
use crate::error::Result;
pub use stats::{IfaceStats, IfaceStatsSnapshot};

/// A port backend: the optimized raw path, or a test double.
pub trait PortIo: Send {
    /// Best-effort transmit; returns the number of frames accepted.
    fn send_batch(&mut self, frames: &[&[u8]]) -> usize;

    /// Non-blocking receive of one frame into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Drains one hardware TX timestamp, when the backend has them.
    fn tx_timestamp(&mut self) -> Option<u64>;
}

impl PortIo for raw::RawPort {
    fn send_batch(&mut self, frames: &[&[u8]]) -> usize {
        raw::RawPort::send_batch(self, frames)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        raw::RawPort::recv(self, buf)
    }

    fn tx_timestamp(&mut self) -> Option<u64> {
        raw::RawPort::tx_timestamp(self)
    }
}

pub struct Interface {
    // Read-mostly: workers snapshot it per template build, discovery rewrites
    // it wholesale.
    config: ArcSwap<InterfaceConfig>,
    port: Mutex<Box<dyn PortIo>>,
    stats: IfaceStats,
    hw_timestamps: bool,
}

impl Interface {
    /// Opens the port named in `config`, degrading an acceleration request to
    /// the raw path (and reclassifying the interface) when the bypass runtime
    /// is unavailable.
    pub fn open(mut config: InterfaceConfig, zero_copy: bool) -> Result<Arc<Self>> {
        if config.interface_type.wants_acceleration() && !accel::acceleration_available() {
            warn!(
                interface = %config.name,
                "acceleration unavailable, reclassifying to optimized raw path"
            );
            config.interface_type = InterfaceType::Sfp10gOptimized;
        }
        let port = raw::RawPort::open(&config.name, zero_copy)?;
        let hw_timestamps = port.hw_timestamps();
        info!(
            interface = %config.name,
            ring = port.has_ring(),
            hw_timestamps,
            "interface initialized"
        );
        Ok(Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            port: Mutex::new(Box::new(port)),
            stats: IfaceStats::default(),
            hw_timestamps,
        }))
    }

    /// Builds an interface over an injected backend (test doubles).
    pub fn with_port(config: InterfaceConfig, port: Box<dyn PortIo>) -> Arc<Self> {
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            port: Mutex::new(port),
            stats: IfaceStats::default(),
            hw_timestamps: false,
        })
    }

    pub fn name(&self) -> String {
        self.config.load().name.clone()
    }

    pub fn config(&self) -> InterfaceConfig {
        self.config.load().as_ref().clone()
    }

    pub fn update_config(&self, mutate: impl FnOnce(&mut InterfaceConfig)) {
        let mut cfg = self.config.load().as_ref().clone();
        mutate(&mut cfg);
        self.config.store(Arc::new(cfg));
    }

    /// Best-effort batched transmit. Accepted frames are counted as TX;
    /// the shortfall increments `dropped`.
    pub fn send_batch(&self, frames: &[&[u8]]) -> usize {
        let accepted = self.port.lock().unwrap().send_batch(frames);
        let bytes: u64 = frames[..accepted].iter().map(|f| f.len() as u64).sum();
        self.stats.add_tx(accepted as u64, bytes);
        self.stats.add_dropped((frames.len() - accepted) as u64);
        accepted
    }

    pub fn recv_frame(&self, buf: &mut [u8]) -> Option<usize> {
        let n = self.port.lock().unwrap().recv(buf)?;
        self.stats.add_rx(1, n as u64);
        Some(n)
    }

    /// A monotonic nanosecond egress timestamp: hardware when negotiated,
    /// otherwise a software sample in the same clock domain.
    pub fn read_tx_timestamp(&self) -> Option<u64> {
        if self.hw_timestamps {
            if let Some(ns) = self.port.lock().unwrap().tx_timestamp() {
                return Some(ns);
            }
        }
        Some(timestamp::monotonic_ns())
    }

    pub fn hw_timestamps(&self) -> bool {
        self.hw_timestamps
    }

    pub fn stats(&self) -> &IfaceStats {
        &self.stats
    }
}

/// Per-interface ingest handler: drains received frames, counts them, and
/// hands each to `handler` (TCP engine dispatch, latency probes).
pub struct IngestHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

pub fn spawn_ingest(
    iface: Arc<Interface>,
    handler: impl Fn(&[u8]) + Send + 'static,
) -> IngestHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let join = std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while !stop_flag.load(Ordering::Relaxed) {
            match iface.recv_frame(&mut buf) {
                Some(n) => handler(&buf[..n]),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    });
    IngestHandle {
        stop,
        join: Some(join),
    }
}

impl IngestHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
