use bytes::BytesMut;
use rand::{rng, Rng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use super::rto::RtoEstimator;
use crate::codec::tcp::{flags, TcpOption, TcpSegment, TcpSegmentView};
use crate::codec::{Ipv4Header, PseudoHeader, IPPROTO_TCP};

/// RFC 793 connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TcpState {
    Closed = 0,
    SynSent = 1,
    SynReceived = 2,
    Established = 3,
    FinWait1 = 4,
    FinWait2 = 5,
    CloseWait = 6,
    Closing = 7,
    LastAck = 8,
    TimeWait = 9,
}

impl TcpState {
    pub fn from_u8(value: u8) -> TcpState {
        match value {
            1 => TcpState::SynSent,
            2 => TcpState::SynReceived,
            3 => TcpState::Established,
            4 => TcpState::FinWait1,
            5 => TcpState::FinWait2,
            6 => TcpState::CloseWait,
            7 => TcpState::Closing,
            8 => TcpState::LastAck,
            9 => TcpState::TimeWait,
            _ => TcpState::Closed,
        }
    }
}

/// (source address, source port, destination address, destination port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

/// `a < b` in 32-bit sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) struct UnackedSegment {
    pub frame: Vec<u8>,
    pub sent_at: Instant,
    pub retries: u8,
}

/// Per-connection record; stays compact so the pool footprint is bounded.
pub(crate) struct SlotInner {
    pub in_use: bool,
    pub tuple: FourTuple,
    pub state: TcpState,
    pub iss: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub mss: u16,
    pub send_window: u16,
    pub unacked: BTreeMap<u32, UnackedSegment>,
    pub out_of_order: BTreeMap<u32, Vec<u8>>,
    pub recv_buf: Vec<u8>,
    pub rto: RtoEstimator,
    pub time_wait_start: Option<Instant>,
    pub retransmits: u64,
}

impl SlotInner {
    pub fn vacant() -> Self {
        Self {
            in_use: false,
            tuple: FourTuple {
                src: Ipv4Addr::UNSPECIFIED,
                src_port: 0,
                dst: Ipv4Addr::UNSPECIFIED,
                dst_port: 0,
            },
            state: TcpState::Closed,
            iss: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            mss: 1460,
            send_window: 65535,
            unacked: BTreeMap::new(),
            out_of_order: BTreeMap::new(),
            recv_buf: Vec::new(),
            rto: RtoEstimator::new(),
            time_wait_start: None,
            retransmits: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = SlotInner::vacant();
    }

    pub fn open(&mut self, tuple: FourTuple, mss: u16, window: u16) {
        self.reset();
        self.in_use = true;
        self.tuple = tuple;
        self.mss = mss;
        self.send_window = window;
        self.iss = rng().random::<u32>();
        self.snd_nxt = self.iss;
    }

    /// Builds an IPv4+TCP frame for this connection.
    pub fn build_segment(&self, seg_flags: u8, options: &[TcpOption], payload: &[u8]) -> Vec<u8> {
        let pseudo = PseudoHeader::V4 {
            src: self.tuple.src,
            dst: self.tuple.dst,
        };
        let mut tcp = BytesMut::new();
        TcpSegment {
            src_port: self.tuple.src_port,
            dst_port: self.tuple.dst_port,
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: seg_flags,
            window: self.send_window,
            options,
            payload,
        }
        .push(&mut tcp, &pseudo);

        let mut frame = BytesMut::with_capacity(20 + tcp.len());
        Ipv4Header::new(self.tuple.src, self.tuple.dst, IPPROTO_TCP, tcp.len())
            .with_identification(rng().random::<u16>())
            .push(&mut frame);
        frame.extend_from_slice(&tcp);
        frame.to_vec()
    }

    pub fn build_syn(&self) -> Vec<u8> {
        self.build_segment(
            flags::SYN,
            &[
                TcpOption::Mss(self.mss),
                TcpOption::WindowScale(7),
                TcpOption::SackPermitted,
            ],
            &[],
        )
    }

    pub fn build_ack(&self) -> Vec<u8> {
        self.build_segment(flags::ACK, &[], &[])
    }

    /// Drives the state machine for one inbound segment, collecting frames to
    /// transmit in `outbox`.
    pub fn handle_segment(
        &mut self,
        seg: &TcpSegmentView,
        payload: &[u8],
        now: Instant,
        outbox: &mut Vec<Vec<u8>>,
    ) {
        self.sample_rtt(seg, now);
        match self.state {
            TcpState::SynSent => self.on_syn_sent(seg, outbox),
            TcpState::Established => self.on_established(seg, payload, outbox),
            TcpState::FinWait1 => self.on_fin_wait_1(seg, now, outbox),
            TcpState::FinWait2 => self.on_fin_wait_2(seg, now, outbox),
            TcpState::Closing => self.on_closing(seg, now),
            TcpState::CloseWait => {} // waiting for the application to close
            TcpState::LastAck => self.on_last_ack(seg),
            TcpState::TimeWait | TcpState::Closed | TcpState::SynReceived => {}
        }
    }

    /// Karn's rule: only segments that were never retransmitted feed the
    /// estimator.
    fn sample_rtt(&mut self, seg: &TcpSegmentView, now: Instant) {
        if !seg.has(flags::ACK) {
            return;
        }
        let newest_acked = self
            .unacked
            .range(..seg.ack)
            .next_back()
            .filter(|(_, unacked)| unacked.retries == 0)
            .map(|(_, unacked)| unacked.sent_at);
        if let Some(sent_at) = newest_acked {
            self.rto.observe(now.duration_since(sent_at));
        }
    }

    fn reap_acked(&mut self, ack: u32) {
        self.unacked.retain(|&seq, _| !seq_lt(seq, ack));
    }

    fn on_syn_sent(&mut self, seg: &TcpSegmentView, outbox: &mut Vec<Vec<u8>>) {
        if seg.has(flags::SYN) && seg.has(flags::ACK) {
            self.rcv_nxt = seg.seq.wrapping_add(1);
            self.unacked.remove(&self.iss);
            for option in &seg.options {
                if let TcpOption::Mss(peer_mss) = option {
                    self.mss = self.mss.min(*peer_mss);
                }
            }
            outbox.push(self.build_ack());
            self.state = TcpState::Established;
        }
    }

    fn on_established(&mut self, seg: &TcpSegmentView, payload: &[u8], outbox: &mut Vec<Vec<u8>>) {
        if seg.has(flags::ACK) {
            self.reap_acked(seg.ack);
        }

        if !payload.is_empty() {
            if seg.seq == self.rcv_nxt {
                self.recv_buf.extend_from_slice(payload);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
                // Deliver any out-of-order runs the gap-filler unlocked.
                while let Some(data) = self.out_of_order.remove(&self.rcv_nxt) {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
                    self.recv_buf.extend_from_slice(&data);
                }
                outbox.push(self.build_ack());
            } else if seq_lt(self.rcv_nxt, seg.seq) {
                self.out_of_order.insert(seg.seq, payload.to_vec());
            }
        }

        if seg.has(flags::FIN) {
            self.rcv_nxt = seg.seq.wrapping_add(payload.len() as u32).wrapping_add(1);
            outbox.push(self.build_ack());
            self.state = TcpState::CloseWait;
        }
    }

    fn on_fin_wait_1(&mut self, seg: &TcpSegmentView, now: Instant, outbox: &mut Vec<Vec<u8>>) {
        let fin_acked = seg.has(flags::ACK) && seg.ack == self.snd_nxt;
        if fin_acked {
            self.reap_acked(seg.ack);
            self.state = TcpState::FinWait2;
        }
        if seg.has(flags::FIN) {
            self.rcv_nxt = seg.seq.wrapping_add(1);
            outbox.push(self.build_ack());
            if fin_acked {
                self.enter_time_wait(now);
            } else {
                self.state = TcpState::Closing;
            }
        }
    }

    fn on_fin_wait_2(&mut self, seg: &TcpSegmentView, now: Instant, outbox: &mut Vec<Vec<u8>>) {
        if seg.has(flags::FIN) {
            self.rcv_nxt = seg.seq.wrapping_add(1);
            outbox.push(self.build_ack());
            self.enter_time_wait(now);
        }
    }

    fn on_closing(&mut self, seg: &TcpSegmentView, now: Instant) {
        if seg.has(flags::ACK) && seg.ack == self.snd_nxt {
            self.enter_time_wait(now);
        }
    }

    fn on_last_ack(&mut self, seg: &TcpSegmentView) {
        if seg.has(flags::ACK) && seg.ack == self.snd_nxt {
            self.state = TcpState::Closed;
        }
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.state = TcpState::TimeWait;
        self.time_wait_start = Some(now);
    }
}
