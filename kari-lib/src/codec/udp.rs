use bytes::BufMut;

use super::{l4_checksum, need, CodecResult, PseudoHeader, IPPROTO_UDP};

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

/// Appends a UDP header plus payload, checksummed against `pseudo`.
pub fn push_udp<B: BufMut>(
    buf: &mut B,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    pseudo: &PseudoHeader,
) {
    let length = (UDP_HEADER_LEN + payload.len()) as u16;
    let mut segment = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    let checksum = l4_checksum(pseudo, IPPROTO_UDP, &segment);
    segment[6..8].copy_from_slice(&checksum.to_be_bytes());
    buf.put_slice(&segment);
}

/// Parses the header and returns it with the payload offset.
pub fn parse_udp(data: &[u8]) -> CodecResult<(UdpHeader, usize)> {
    need(data, UDP_HEADER_LEN, "udp header")?;
    Ok((
        UdpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
        },
        UDP_HEADER_LEN,
    ))
}
