use bytes::BufMut;

use super::{l4_checksum, need, CodecError, CodecResult, PseudoHeader, IPPROTO_TCP};

pub const TCP_HEADER_LEN: usize = 20;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_TIMESTAMP: u8 = 8;

/// TCP options encoded TLV-style with NOP padding to a 4-byte boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamp { val: u32, ecr: u32 },
}

impl TcpOption {
    fn encoded_len(&self) -> usize {
        match self {
            TcpOption::Mss(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Timestamp { .. } => 10,
        }
    }

    fn push(&self, out: &mut Vec<u8>) {
        match self {
            TcpOption::Mss(mss) => {
                out.extend_from_slice(&[OPT_MSS, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => out.extend_from_slice(&[OPT_WINDOW_SCALE, 3, *shift]),
            TcpOption::SackPermitted => out.extend_from_slice(&[OPT_SACK_PERMITTED, 2]),
            TcpOption::Timestamp { val, ecr } => {
                out.extend_from_slice(&[OPT_TIMESTAMP, 10]);
                out.extend_from_slice(&val.to_be_bytes());
                out.extend_from_slice(&ecr.to_be_bytes());
            }
        }
    }
}

/// A TCP segment to encode: header, options, payload.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: &'a [TcpOption],
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Encodes header + options + payload, checksummed against `pseudo`.
    pub fn push<B: BufMut>(&self, buf: &mut B, pseudo: &PseudoHeader) {
        let opts_len: usize = self.options.iter().map(|o| o.encoded_len()).sum();
        let padded = (opts_len + 3) & !3;
        let header_len = TCP_HEADER_LEN + padded;
        let mut segment = Vec::with_capacity(header_len + self.payload.len());
        segment.extend_from_slice(&self.src_port.to_be_bytes());
        segment.extend_from_slice(&self.dst_port.to_be_bytes());
        segment.extend_from_slice(&self.seq.to_be_bytes());
        segment.extend_from_slice(&self.ack.to_be_bytes());
        segment.push(((header_len / 4) as u8) << 4);
        segment.push(self.flags);
        segment.extend_from_slice(&self.window.to_be_bytes());
        segment.extend_from_slice(&[0, 0]); // checksum
        segment.extend_from_slice(&[0, 0]); // urgent pointer
        for option in self.options {
            option.push(&mut segment);
        }
        for _ in opts_len..padded {
            segment.push(OPT_NOP);
        }
        segment.extend_from_slice(self.payload);
        let checksum = l4_checksum(pseudo, IPPROTO_TCP, &segment);
        segment[16..18].copy_from_slice(&checksum.to_be_bytes());
        buf.put_slice(&segment);
    }
}

/// Parsed view of a TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegmentView {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: Vec<TcpOption>,
    /// Offset of the payload within the parsed slice.
    pub payload_offset: usize,
}

impl TcpSegmentView {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn parse(data: &[u8]) -> CodecResult<Self> {
        need(data, TCP_HEADER_LEN, "tcp header")?;
        let data_offset = usize::from(data[12] >> 4) * 4;
        if data_offset < TCP_HEADER_LEN {
            return Err(CodecError::Invalid("tcp data offset"));
        }
        need(data, data_offset, "tcp header with options")?;
        let options = parse_options(&data[TCP_HEADER_LEN..data_offset])?;
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            options,
            payload_offset: data_offset,
        })
    }
}

fn parse_options(mut data: &[u8]) -> CodecResult<Vec<TcpOption>> {
    let mut options = Vec::new();
    while let Some(&kind) = data.first() {
        match kind {
            OPT_END => break,
            OPT_NOP => {
                data = &data[1..];
                continue;
            }
            _ => {}
        }
        need(data, 2, "tcp option header")?;
        let len = usize::from(data[1]);
        if len < 2 {
            return Err(CodecError::Invalid("tcp option length"));
        }
        need(data, len, "tcp option body")?;
        let body = &data[2..len];
        match kind {
            OPT_MSS if body.len() == 2 => {
                options.push(TcpOption::Mss(u16::from_be_bytes([body[0], body[1]])));
            }
            OPT_WINDOW_SCALE if body.len() == 1 => {
                options.push(TcpOption::WindowScale(body[0]));
            }
            OPT_SACK_PERMITTED if body.is_empty() => options.push(TcpOption::SackPermitted),
            OPT_TIMESTAMP if body.len() == 8 => options.push(TcpOption::Timestamp {
                val: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                ecr: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            }),
            // Unknown or malformed options are skipped, not fatal.
            _ => {}
        }
        data = &data[len..];
    }
    Ok(options)
}
