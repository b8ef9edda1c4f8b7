//! Frame builders and parsers for every wire format the engine speaks.
//!
//! Builders append to a caller-supplied buffer and never allocate beyond it;
//! parsers return record views and fail with a value, never a panic, when a
//! field runs past the buffer.

pub mod bgp;
pub mod ethernet;
pub mod icmpv6;
pub mod ipv4;
pub mod ipv6;
pub mod mpls;
pub mod netflow;
pub mod tcp;
pub mod udp;
pub mod vxlan;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

pub use ethernet::{EthernetHeader, VlanTag};
pub use ipv4::Ipv4Header;
pub use ipv6::Ipv6Header;
pub use mpls::MplsLabel;
pub use tcp::{TcpOption, TcpSegment, TcpSegmentView};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88A8;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_MPLS: u16 = 0x8847;

pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// UDP port carrying VXLAN per RFC 7348.
pub const VXLAN_PORT: u16 = 4789;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame of {got} bytes is shorter than the {need}-byte header stack")]
    FrameTooShort { need: usize, got: usize },

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("{what} length field {field} exceeds outer length {outer}")]
    LengthOverrun {
        what: &'static str,
        field: usize,
        outer: usize,
    },

    #[error("unsupported {what}: {value:#x}")]
    Unsupported { what: &'static str, value: u32 },

    #[error("invalid {0}")]
    Invalid(&'static str),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// 48-bit link-layer address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

impl FromStr for MacAddr {
    type Err = CodecError;

    fn from_str(s: &str) -> CodecResult<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for slot in out.iter_mut() {
            let part = parts.next().ok_or(CodecError::Invalid("mac address"))?;
            *slot =
                u8::from_str_radix(part, 16).map_err(|_| CodecError::Invalid("mac address"))?;
        }
        if parts.next().is_some() {
            return Err(CodecError::Invalid("mac address"));
        }
        Ok(MacAddr(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// One's-complement sum folded to 16 bits, per RFC 1071.
pub(crate) fn ones_complement_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

pub(crate) fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over a single contiguous region.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold_checksum(ones_complement_add(0, data))
}

/// Pseudo-header feeding the UDP/TCP/ICMPv6 checksum.
#[derive(Debug, Clone, Copy)]
pub enum PseudoHeader {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

impl PseudoHeader {
    /// Partial sum covering addresses, protocol, and L4 length.
    pub(crate) fn sum(&self, protocol: u8, l4_len: usize) -> u32 {
        let mut sum = 0u32;
        match self {
            PseudoHeader::V4 { src, dst } => {
                sum = ones_complement_add(sum, &src.octets());
                sum = ones_complement_add(sum, &dst.octets());
                sum += u32::from(protocol);
                sum += l4_len as u32;
            }
            PseudoHeader::V6 { src, dst } => {
                sum = ones_complement_add(sum, &src.octets());
                sum = ones_complement_add(sum, &dst.octets());
                sum += l4_len as u32;
                sum += u32::from(protocol);
            }
        }
        sum
    }
}

/// Checksum of an L4 segment under the given pseudo-header.
pub fn l4_checksum(pseudo: &PseudoHeader, protocol: u8, segment: &[u8]) -> u16 {
    fold_checksum(ones_complement_add(
        pseudo.sum(protocol, segment.len()),
        segment,
    ))
}

pub(crate) fn need(data: &[u8], n: usize, what: &'static str) -> CodecResult<()> {
    if data.len() < n {
        return Err(CodecError::Truncated {
            what,
            need: n,
            have: data.len(),
        });
    }
    Ok(())
}
