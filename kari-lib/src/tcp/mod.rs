//! Stateful TCP engine: a slot-indexed connection pool, the RFC 793 state
//! machine, MSS segmentation, and a 10 Hz retransmission sweeper.

pub mod rto;
mod slot;

use ahash::RandomState;
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::codec::tcp::{flags, TcpSegmentView};
use crate::codec::{ethernet, Ipv4Header, ETHERTYPE_IPV4, IPPROTO_TCP};
use crate::error::{EngineError, Result};
use crate::iface::{timestamp, Interface};
pub use rto::RtoEstimator;
pub use slot::{seq_lt, FourTuple, TcpState};
use slot::{SlotInner, UnackedSegment};

/// TIME_WAIT duration, 2·MSL.
pub const TIME_WAIT: Duration = Duration::from_secs(120);
/// Retransmission attempts before the connection is abandoned.
pub const MAX_RETRIES: u8 = 5;
/// Sweeper cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Where the engine's synthesized IPv4+TCP frames go.
pub trait SegmentTx: Send + Sync {
    fn transmit(&self, frame: &[u8]);
}

/// Transmit path that fronts an interface, wrapping segments in Ethernet.
pub struct L2SegmentTx {
    iface: Arc<Interface>,
    src_mac: crate::codec::MacAddr,
    dst_mac: crate::codec::MacAddr,
}

impl L2SegmentTx {
    pub fn new(
        iface: Arc<Interface>,
        src_mac: crate::codec::MacAddr,
        dst_mac: crate::codec::MacAddr,
    ) -> Self {
        Self {
            iface,
            src_mac,
            dst_mac,
        }
    }
}

impl SegmentTx for L2SegmentTx {
    fn transmit(&self, frame: &[u8]) {
        let mut l2 = bytes::BytesMut::with_capacity(ethernet::ETH_HEADER_LEN + frame.len());
        ethernet::push_ethernet(&mut l2, self.dst_mac, self.src_mac, &[], ETHERTYPE_IPV4);
        l2.extend_from_slice(frame);
        self.iface.send_batch(&[&l2]);
    }
}

#[derive(Debug, Clone)]
pub struct TcpEngineConfig {
    /// Connection slots preallocated at startup.
    pub capacity: usize,
    pub mss: u16,
    pub window: u16,
    /// Pool prefix scanned when a forced reclaim is needed.
    pub reclaim_scan: usize,
}

impl Default for TcpEngineConfig {
    fn default() -> Self {
        Self {
            capacity: 500_000,
            mss: 1460,
            window: 65535,
            reclaim_scan: 4_096,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TcpPoolStats {
    pub capacity: usize,
    pub active: usize,
    pub free: usize,
    pub created: u64,
    pub closed: u64,
    pub forced_reclaims: u64,
    pub parse_errors: u64,
    pub utilization: f64,
}

pub struct TcpEngine {
    cfg: TcpEngineConfig,
    // Parallel arrays: state and activity are readable without slot locks so
    // the sweeper and reclaim scan stay cheap.
    states: Vec<AtomicU8>,
    activity_ms: Vec<AtomicU64>,
    slots: Vec<Mutex<SlotInner>>,
    free: ArrayQueue<u32>,
    tuples: Mutex<HashMap<FourTuple, u32, RandomState>>,
    tx: Arc<dyn SegmentTx>,
    created: AtomicU64,
    closed: AtomicU64,
    forced_reclaims: AtomicU64,
    parse_errors: AtomicU64,
}

impl TcpEngine {
    pub fn new(cfg: TcpEngineConfig, tx: Arc<dyn SegmentTx>) -> Arc<Self> {
        let capacity = cfg.capacity;
        let free = ArrayQueue::new(capacity);
        for i in 0..capacity as u32 {
            let _ = free.push(i);
        }
        Arc::new(Self {
            cfg,
            states: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            activity_ms: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            slots: (0..capacity).map(|_| Mutex::new(SlotInner::vacant())).collect(),
            free,
            tuples: Mutex::new(HashMap::with_hasher(RandomState::default())),
            tx,
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            forced_reclaims: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        })
    }

    /// Active open. Blocks (polling) until ESTABLISHED or `timeout`; on
    /// timeout the slot transitions back to CLOSED and is released.
    pub fn connect(&self, tuple: FourTuple, timeout: Duration) -> Result<u32> {
        let idx = self.allocate(tuple)?;
        {
            let mut inner = self.slots[idx as usize].lock().unwrap();
            inner.open(tuple, self.cfg.mss, self.cfg.window);
            let syn = inner.build_syn();
            let iss = inner.iss;
            inner.unacked.insert(
                iss,
                UnackedSegment {
                    frame: syn.clone(),
                    sent_at: Instant::now(),
                    retries: 0,
                },
            );
            inner.snd_nxt = iss.wrapping_add(1);
            inner.state = TcpState::SynSent;
            self.sync_slot(idx, &inner);
            self.tx.transmit(&syn);
        }
        self.created.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + timeout;
        loop {
            match self.state(idx) {
                TcpState::Established => return Ok(idx),
                TcpState::Closed => {
                    return Err(EngineError::Transport(format!(
                        "connection to {}:{} reset",
                        tuple.dst, tuple.dst_port
                    )))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                {
                    let mut inner = self.slots[idx as usize].lock().unwrap();
                    inner.state = TcpState::Closed;
                    self.sync_slot(idx, &inner);
                }
                self.release(idx);
                return Err(EngineError::Timeout(format!(
                    "tcp connect to {}:{}",
                    tuple.dst, tuple.dst_port
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Segments `data` at the negotiated MSS and transmits, tracking each
    /// segment for retransmission.
    pub fn send(&self, idx: u32, data: &[u8]) -> Result<usize> {
        let mut inner = self.slots[idx as usize].lock().unwrap();
        if inner.state != TcpState::Established {
            return Err(EngineError::Transport(format!(
                "cannot send in state {:?}",
                inner.state
            )));
        }
        let mss = usize::from(inner.mss);
        let mut sent = 0;
        for chunk in data.chunks(mss) {
            let frame = inner.build_segment(flags::PSH | flags::ACK, &[], chunk);
            let seq = inner.snd_nxt;
            inner.unacked.insert(
                seq,
                UnackedSegment {
                    frame: frame.clone(),
                    sent_at: Instant::now(),
                    retries: 0,
                },
            );
            inner.snd_nxt = seq.wrapping_add(chunk.len() as u32);
            self.tx.transmit(&frame);
            sent += chunk.len();
        }
        self.sync_slot(idx, &inner);
        Ok(sent)
    }

    /// Drains up to `max` bytes of ordered received data.
    pub fn receive(&self, idx: u32, max: usize) -> Vec<u8> {
        let mut inner = self.slots[idx as usize].lock().unwrap();
        let take = inner.recv_buf.len().min(max);
        inner.recv_buf.drain(..take).collect()
    }

    /// Active close from ESTABLISHED, or the final close from CLOSE_WAIT.
    pub fn close(&self, idx: u32) -> Result<()> {
        let mut inner = self.slots[idx as usize].lock().unwrap();
        match inner.state {
            TcpState::Established => {
                let fin = inner.build_segment(flags::FIN | flags::ACK, &[], &[]);
                inner.snd_nxt = inner.snd_nxt.wrapping_add(1);
                inner.state = TcpState::FinWait1;
                self.sync_slot(idx, &inner);
                self.tx.transmit(&fin);
                Ok(())
            }
            TcpState::CloseWait => {
                let fin = inner.build_segment(flags::FIN | flags::ACK, &[], &[]);
                inner.snd_nxt = inner.snd_nxt.wrapping_add(1);
                inner.state = TcpState::LastAck;
                self.sync_slot(idx, &inner);
                self.tx.transmit(&fin);
                Ok(())
            }
            other => Err(EngineError::Transport(format!(
                "cannot close in state {other:?}"
            ))),
        }
    }

    pub fn state(&self, idx: u32) -> TcpState {
        TcpState::from_u8(self.states[idx as usize].load(Ordering::Acquire))
    }

    pub fn retransmit_count(&self, idx: u32) -> u64 {
        self.slots[idx as usize].lock().unwrap().retransmits
    }

    /// Entry point for inbound L2 frames from the interface ingest handler.
    /// Frames that are not IPv4/TCP are ignored; malformed ones increment the
    /// parse-error counter and are discarded without retry.
    pub fn handle_frame(&self, frame: &[u8]) {
        let link = match ethernet::parse_link_layer(frame) {
            Ok(link) if link.ethertype == ETHERTYPE_IPV4 => link,
            Ok(_) => return,
            Err(err) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "discarding malformed frame");
                return;
            }
        };
        let ip_bytes = &frame[link.payload_offset..];
        let parsed = Ipv4Header::parse(ip_bytes).and_then(|(ip, ihl)| {
            ip_bytes
                .get(ihl..usize::from(ip.total_len))
                .ok_or(crate::codec::CodecError::Invalid("ipv4 total length"))
                .map(|segment| (ip, segment))
        });
        match parsed {
            Ok((ip, segment)) if ip.protocol == IPPROTO_TCP => {
                self.handle_ip_packet(&ip, segment);
            }
            Ok(_) => {}
            Err(err) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "discarding malformed frame");
            }
        }
    }

    /// Dispatches one IPv4-encapsulated TCP segment to its slot.
    pub fn handle_ip_packet(&self, ip: &Ipv4Header, segment: &[u8]) {
        let seg = match TcpSegmentView::parse(segment) {
            Ok(seg) => seg,
            Err(err) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "discarding malformed tcp segment");
                return;
            }
        };
        // Inbound frames carry the peer's view; flip to our tuple.
        let key = FourTuple {
            src: ip.dst,
            src_port: seg.dst_port,
            dst: ip.src,
            dst_port: seg.src_port,
        };
        let idx = {
            let tuples = self.tuples.lock().unwrap();
            match tuples.get(&key) {
                Some(&idx) => idx,
                None => return,
            }
        };

        let payload = &segment[seg.payload_offset..];
        let now = Instant::now();
        let mut outbox = Vec::new();
        let became_closed = {
            let mut inner = self.slots[idx as usize].lock().unwrap();
            if !inner.in_use || inner.tuple != key {
                return;
            }
            inner.handle_segment(&seg, payload, now, &mut outbox);
            self.sync_slot(idx, &inner);
            inner.state == TcpState::Closed
        };
        for frame in outbox {
            self.tx.transmit(&frame);
        }
        if became_closed {
            self.release(idx);
        }
    }

    /// One retransmission/reaping pass. The sweeper calls this at 10 Hz;
    /// tests may pass a synthetic `now`.
    pub fn sweep(&self, now: Instant) {
        for idx in 0..self.cfg.capacity as u32 {
            let state = self.state(idx);
            if state == TcpState::Closed {
                continue;
            }
            if state == TcpState::TimeWait {
                let expired = {
                    let inner = self.slots[idx as usize].lock().unwrap();
                    inner
                        .time_wait_start
                        .is_some_and(|start| now.duration_since(start) >= TIME_WAIT)
                };
                if expired {
                    self.release(idx);
                }
                continue;
            }

            let mut retransmit = None;
            let gave_up = {
                let mut inner = self.slots[idx as usize].lock().unwrap();
                if !inner.in_use {
                    continue;
                }
                let rto = inner.rto.current();
                let oldest = inner.unacked.iter_mut().next();
                match oldest {
                    Some((_, seg)) if now.duration_since(seg.sent_at) >= rto => {
                        if seg.retries < MAX_RETRIES {
                            seg.retries += 1;
                            seg.sent_at = now;
                            retransmit = Some(seg.frame.clone());
                            inner.retransmits += 1;
                            inner.rto.backoff();
                            false
                        } else {
                            warn!(
                                dst = %inner.tuple.dst,
                                port = inner.tuple.dst_port,
                                "retransmit limit reached, abandoning connection"
                            );
                            inner.state = TcpState::Closed;
                            self.sync_slot(idx, &inner);
                            true
                        }
                    }
                    _ => false,
                }
            };
            if let Some(frame) = retransmit {
                self.tx.transmit(&frame);
            }
            if gave_up {
                self.release(idx);
            }
        }
    }

    /// Background sweeper task; runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let engine = Arc::clone(&engine);
                // Slot locks are brief, but keep the scan off the runtime.
                let _ = tokio::task::spawn_blocking(move || engine.sweep(Instant::now())).await;
            }
        })
    }

    pub fn stats(&self) -> TcpPoolStats {
        let free = self.free.len();
        let active = self.cfg.capacity - free;
        TcpPoolStats {
            capacity: self.cfg.capacity,
            active,
            free,
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            forced_reclaims: self.forced_reclaims.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            utilization: active as f64 / self.cfg.capacity as f64,
        }
    }

    fn allocate(&self, tuple: FourTuple) -> Result<u32> {
        let mut tuples = self.tuples.lock().unwrap();
        if tuples.contains_key(&tuple) {
            return Err(EngineError::Config(format!(
                "connection already exists: {}:{} -> {}:{}",
                tuple.src, tuple.src_port, tuple.dst, tuple.dst_port
            )));
        }
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => self
                .force_reclaim(&mut tuples)
                .ok_or_else(|| EngineError::Resource("tcp slot pool exhausted".into()))?,
        };
        tuples.insert(tuple, idx);
        Ok(idx)
    }

    /// With the free queue empty, releases the oldest ESTABLISHED slot found
    /// in a bounded prefix scan.
    fn force_reclaim(&self, tuples: &mut HashMap<FourTuple, u32, RandomState>) -> Option<u32> {
        let scan = self.cfg.reclaim_scan.min(self.cfg.capacity);
        let mut oldest: Option<(u32, u64)> = None;
        for idx in 0..scan as u32 {
            if self.state(idx) == TcpState::Established {
                let activity = self.activity_ms[idx as usize].load(Ordering::Relaxed);
                if oldest.map(|(_, best)| activity < best).unwrap_or(true) {
                    oldest = Some((idx, activity));
                }
            }
        }
        let (idx, _) = oldest?;
        {
            let mut inner = self.slots[idx as usize].lock().unwrap();
            tuples.remove(&inner.tuple);
            inner.reset();
            self.states[idx as usize].store(TcpState::Closed as u8, Ordering::Release);
        }
        self.forced_reclaims.fetch_add(1, Ordering::Relaxed);
        self.closed.fetch_add(1, Ordering::Relaxed);
        Some(idx)
    }

    /// Returns a slot to the pool; idempotent per allocation.
    fn release(&self, idx: u32) {
        let mut tuples = self.tuples.lock().unwrap();
        let mut inner = self.slots[idx as usize].lock().unwrap();
        if !inner.in_use {
            return;
        }
        tuples.remove(&inner.tuple);
        inner.reset();
        self.states[idx as usize].store(TcpState::Closed as u8, Ordering::Release);
        drop(inner);
        drop(tuples);
        self.closed.fetch_add(1, Ordering::Relaxed);
        let _ = self.free.push(idx);
    }

    fn sync_slot(&self, idx: u32, inner: &SlotInner) {
        self.states[idx as usize].store(inner.state as u8, Ordering::Release);
        self.activity_ms[idx as usize]
            .store(timestamp::monotonic_ns() / 1_000_000, Ordering::Relaxed);
    }
}
