use bytes::BufMut;

use super::{need, CodecError, CodecResult};

pub const VXLAN_HEADER_LEN: usize = 8;

const FLAG_VNI_VALID: u8 = 0x08;

/// Appends a VXLAN header per RFC 7348; the inner Ethernet frame follows.
pub fn push_vxlan<B: BufMut>(buf: &mut B, vni: u32) {
    buf.put_u8(FLAG_VNI_VALID);
    buf.put_slice(&[0, 0, 0]);
    buf.put_u32((vni & 0x00ff_ffff) << 8);
}

/// Returns the VNI and the inner-frame offset.
pub fn parse_vxlan(data: &[u8]) -> CodecResult<(u32, usize)> {
    need(data, VXLAN_HEADER_LEN, "vxlan header")?;
    if data[0] & FLAG_VNI_VALID == 0 {
        return Err(CodecError::Invalid("vxlan flags"));
    }
    let word = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Ok((word >> 8, VXLAN_HEADER_LEN))
}
