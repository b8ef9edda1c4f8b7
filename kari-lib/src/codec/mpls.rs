use bytes::BufMut;

use super::{need, CodecResult};

pub const MPLS_LABEL_LEN: usize = 4;

/// One 32-bit MPLS label stack entry per RFC 3032.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MplsLabel {
    /// 20-bit label value.
    pub label: u32,
    /// 3-bit traffic class (former EXP).
    pub tc: u8,
    /// Bottom-of-stack marker; set on the innermost entry only.
    pub bos: bool,
    pub ttl: u8,
}

impl MplsLabel {
    pub fn new(label: u32) -> Self {
        Self {
            label,
            tc: 0,
            bos: true,
            ttl: 64,
        }
    }

    pub fn push<B: BufMut>(&self, buf: &mut B) {
        let word = ((self.label & 0x000f_ffff) << 12)
            | (u32::from(self.tc & 0x7) << 9)
            | (u32::from(self.bos) << 8)
            | u32::from(self.ttl);
        buf.put_u32(word);
    }

    pub fn parse(data: &[u8]) -> CodecResult<(Self, usize)> {
        need(data, MPLS_LABEL_LEN, "mpls label")?;
        let word = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok((
            Self {
                label: word >> 12,
                tc: ((word >> 9) & 0x7) as u8,
                bos: word & 0x100 != 0,
                ttl: (word & 0xff) as u8,
            },
            MPLS_LABEL_LEN,
        ))
    }
}

/// Appends a label stack, outer-first, forcing BoS on the innermost entry.
pub fn push_stack<B: BufMut>(buf: &mut B, labels: &[MplsLabel]) {
    for (i, label) in labels.iter().enumerate() {
        let mut entry = *label;
        entry.bos = i == labels.len() - 1;
        entry.push(buf);
    }
}

/// Parses a label stack up to and including the BoS entry.
pub fn parse_stack(data: &[u8]) -> CodecResult<(Vec<MplsLabel>, usize)> {
    let mut labels = Vec::new();
    let mut offset = 0;
    loop {
        let (label, used) = MplsLabel::parse(&data[offset..])?;
        offset += used;
        let bos = label.bos;
        labels.push(label);
        if bos {
            return Ok((labels, offset));
        }
    }
}
