use bytes::BufMut;
use std::net::Ipv4Addr;

use super::{fold_checksum, need, ones_complement_add, CodecError, CodecResult};

pub const IPV4_HEADER_LEN: usize = 20;

/// IPv4 header, IHL fixed at 5 (no options).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// DiffServ code point; written to the upper six bits of the ToS octet.
    pub dscp: u8,
    /// Header plus payload length.
    pub total_len: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Self {
        Self {
            dscp: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            identification: 0,
            dont_fragment: true,
            ttl: 64,
            protocol,
            src,
            dst,
        }
    }

    pub fn with_dscp(mut self, dscp: u8) -> Self {
        self.dscp = dscp;
        self
    }

    pub fn with_identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    fn encode(&self, checksum: u16) -> [u8; IPV4_HEADER_LEN] {
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        hdr[0] = 0x45;
        hdr[1] = self.dscp << 2;
        hdr[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        hdr[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let flags: u16 = if self.dont_fragment { 0x4000 } else { 0 };
        hdr[6..8].copy_from_slice(&flags.to_be_bytes());
        hdr[8] = self.ttl;
        hdr[9] = self.protocol;
        hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
        hdr[12..16].copy_from_slice(&self.src.octets());
        hdr[16..20].copy_from_slice(&self.dst.octets());
        hdr
    }

    /// Appends the header with its checksum computed.
    pub fn push<B: BufMut>(&self, buf: &mut B) {
        let unsummed = self.encode(0);
        let checksum = fold_checksum(ones_complement_add(0, &unsummed));
        buf.put_slice(&self.encode(checksum));
    }

    pub fn parse(data: &[u8]) -> CodecResult<(Self, usize)> {
        need(data, IPV4_HEADER_LEN, "ipv4 header")?;
        if data[0] >> 4 != 4 {
            return Err(CodecError::Invalid("ipv4 version"));
        }
        let ihl = usize::from(data[0] & 0x0f) * 4;
        need(data, ihl, "ipv4 header with options")?;
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if usize::from(total_len) > data.len() {
            return Err(CodecError::LengthOverrun {
                what: "ipv4 total length",
                field: usize::from(total_len),
                outer: data.len(),
            });
        }
        Ok((
            Self {
                dscp: data[1] >> 2,
                total_len,
                identification: u16::from_be_bytes([data[4], data[5]]),
                dont_fragment: u16::from_be_bytes([data[6], data[7]]) & 0x4000 != 0,
                ttl: data[8],
                protocol: data[9],
                src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
                dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            },
            ihl,
        ))
    }

    /// Recomputes and verifies the header checksum.
    pub fn verify_checksum(data: &[u8]) -> CodecResult<bool> {
        need(data, IPV4_HEADER_LEN, "ipv4 header")?;
        let ihl = usize::from(data[0] & 0x0f) * 4;
        need(data, ihl, "ipv4 header with options")?;
        Ok(fold_checksum(ones_complement_add(0, &data[..ihl])) == 0)
    }
}
