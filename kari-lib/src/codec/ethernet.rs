use bytes::BufMut;

use super::{need, CodecError, CodecResult, MacAddr, ETHERTYPE_QINQ, ETHERTYPE_VLAN};

pub const ETH_HEADER_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn push<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.dst.0);
        buf.put_slice(&self.src.0);
        buf.put_u16(self.ethertype);
    }

    pub fn parse(data: &[u8]) -> CodecResult<(Self, usize)> {
        need(data, ETH_HEADER_LEN, "ethernet header")?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        Ok((
            Self {
                dst: MacAddr(dst),
                src: MacAddr(src),
                ethertype,
            },
            ETH_HEADER_LEN,
        ))
    }
}

/// 802.1Q / 802.1ad tag. The TPID is the EtherType that introduced the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTag {
    pub tpid: u16,
    pub pcp: u8,
    pub dei: bool,
    pub vid: u16,
}

impl VlanTag {
    pub fn dot1q(vid: u16, pcp: u8) -> Self {
        Self {
            tpid: ETHERTYPE_VLAN,
            pcp,
            dei: false,
            vid,
        }
    }

    pub fn dot1ad(vid: u16, pcp: u8) -> Self {
        Self {
            tpid: ETHERTYPE_QINQ,
            pcp,
            dei: false,
            vid,
        }
    }

    /// Appends the TCI plus the EtherType of what follows the tag.
    pub fn push<B: BufMut>(&self, buf: &mut B, inner_ethertype: u16) {
        let tci =
            (u16::from(self.pcp & 0x7) << 13) | (u16::from(self.dei) << 12) | (self.vid & 0x0fff);
        buf.put_u16(tci);
        buf.put_u16(inner_ethertype);
    }

    /// Parses the TCI and following EtherType at `data`, for a tag that was
    /// introduced by `tpid`.
    pub fn parse(tpid: u16, data: &[u8]) -> CodecResult<(Self, u16, usize)> {
        need(data, VLAN_TAG_LEN, "vlan tag")?;
        let tci = u16::from_be_bytes([data[0], data[1]]);
        let inner = u16::from_be_bytes([data[2], data[3]]);
        Ok((
            Self {
                tpid,
                pcp: (tci >> 13) as u8,
                dei: tci & 0x1000 != 0,
                vid: tci & 0x0fff,
            },
            inner,
            VLAN_TAG_LEN,
        ))
    }
}

/// Writes a complete Ethernet header with an optional tag stack.
///
/// `tags` is outer-first; `ethertype` is the payload EtherType after the
/// innermost tag.
pub fn push_ethernet<B: BufMut>(
    buf: &mut B,
    dst: MacAddr,
    src: MacAddr,
    tags: &[VlanTag],
    ethertype: u16,
) {
    buf.put_slice(&dst.0);
    buf.put_slice(&src.0);
    match tags.split_first() {
        None => buf.put_u16(ethertype),
        Some((first, rest)) => {
            buf.put_u16(first.tpid);
            let mut remaining = rest.iter().peekable();
            let mut tag = first;
            loop {
                let inner = remaining.peek().map(|t| t.tpid).unwrap_or(ethertype);
                tag.push(buf, inner);
                match remaining.next() {
                    Some(next) => tag = next,
                    None => break,
                }
            }
        }
    }
}

/// Parsed link layer: header, tag stack (outer-first), payload EtherType and
/// offset where the payload begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLayer {
    pub header: EthernetHeader,
    pub tags: Vec<VlanTag>,
    pub ethertype: u16,
    pub payload_offset: usize,
}

pub fn parse_link_layer(data: &[u8]) -> CodecResult<LinkLayer> {
    let (header, mut offset) = EthernetHeader::parse(data)?;
    let mut tags = Vec::new();
    let mut ethertype = header.ethertype;
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        if tags.len() == 2 {
            return Err(CodecError::Unsupported {
                what: "vlan stack depth",
                value: 3,
            });
        }
        let (tag, inner, used) = VlanTag::parse(ethertype, &data[offset..])?;
        tags.push(tag);
        ethertype = inner;
        offset += used;
    }
    Ok(LinkLayer {
        header,
        tags,
        ethertype,
        payload_offset: offset,
    })
}
