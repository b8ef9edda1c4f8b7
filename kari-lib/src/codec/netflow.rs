//! NetFlow v5 and IPFIX (RFC 7011) datagram builders.

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

use super::{need, CodecError, CodecResult};

pub const V5_HEADER_LEN: usize = 24;
pub const V5_RECORD_LEN: usize = 48;
/// A v5 datagram carries at most this many records.
pub const V5_MAX_RECORDS: usize = 30;

pub const IPFIX_HEADER_LEN: usize = 16;
pub const IPFIX_TEMPLATE_SET_ID: u16 = 2;
/// Template id used for the engine's flow record layout.
pub const IPFIX_FLOW_TEMPLATE_ID: u16 = 256;

/// One unidirectional flow, the unit both exporters consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub packets: u64,
    pub octets: u64,
    /// Flow start/end, milliseconds in the exporter's uptime domain.
    pub first_ms: u32,
    pub last_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V5Header {
    pub count: u16,
    pub sys_uptime_ms: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
}

impl V5Header {
    pub fn push<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(5);
        buf.put_u16(self.count);
        buf.put_u32(self.sys_uptime_ms);
        buf.put_u32(self.unix_secs);
        buf.put_u32(self.unix_nsecs);
        buf.put_u32(self.flow_sequence);
        buf.put_u8(self.engine_type);
        buf.put_u8(self.engine_id);
        buf.put_u16(0); // sampling interval
    }

    pub fn parse(data: &[u8]) -> CodecResult<(Self, usize)> {
        need(data, V5_HEADER_LEN, "netflow v5 header")?;
        let version = u16::from_be_bytes([data[0], data[1]]);
        if version != 5 {
            return Err(CodecError::Unsupported {
                what: "netflow version",
                value: u32::from(version),
            });
        }
        Ok((
            Self {
                count: u16::from_be_bytes([data[2], data[3]]),
                sys_uptime_ms: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                unix_secs: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                unix_nsecs: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
                flow_sequence: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
                engine_type: data[20],
                engine_id: data[21],
            },
            V5_HEADER_LEN,
        ))
    }
}

fn push_v5_record<B: BufMut>(buf: &mut B, flow: &FlowRecord) {
    buf.put_slice(&flow.src_addr.octets());
    buf.put_slice(&flow.dst_addr.octets());
    buf.put_slice(&Ipv4Addr::UNSPECIFIED.octets()); // next hop
    buf.put_u16(1); // input SNMP index
    buf.put_u16(2); // output SNMP index
    buf.put_u32(flow.packets as u32);
    buf.put_u32(flow.octets as u32);
    buf.put_u32(flow.first_ms);
    buf.put_u32(flow.last_ms);
    buf.put_u16(flow.src_port);
    buf.put_u16(flow.dst_port);
    buf.put_u8(0); // pad
    buf.put_u8(if flow.protocol == 6 { 0x18 } else { 0 }); // ACK|PSH for TCP
    buf.put_u8(flow.protocol);
    buf.put_u8(0); // tos
    buf.put_u16(0); // src AS
    buf.put_u16(0); // dst AS
    buf.put_u8(24); // src mask
    buf.put_u8(24); // dst mask
    buf.put_u16(0); // pad
}

/// Builds one v5 datagram; `flows` must hold at most [`V5_MAX_RECORDS`].
pub fn build_v5_datagram(header: &V5Header, flows: &[FlowRecord]) -> CodecResult<Vec<u8>> {
    if flows.len() > V5_MAX_RECORDS {
        return Err(CodecError::Invalid("netflow v5 record count"));
    }
    let mut buf = BytesMut::with_capacity(V5_HEADER_LEN + flows.len() * V5_RECORD_LEN);
    let mut header = *header;
    header.count = flows.len() as u16;
    header.push(&mut buf);
    for flow in flows {
        push_v5_record(&mut buf, flow);
    }
    Ok(buf.to_vec())
}

// IPFIX information elements for template 256, in record order.
const IPFIX_FIELDS: [(u16, u16); 9] = [
    (8, 4),   // sourceIPv4Address
    (12, 4),  // destinationIPv4Address
    (4, 1),   // protocolIdentifier
    (7, 2),   // sourceTransportPort
    (11, 2),  // destinationTransportPort
    (2, 8),   // packetDeltaCount
    (1, 8),   // octetDeltaCount
    (152, 8), // flowStartMilliseconds
    (153, 8), // flowEndMilliseconds
];

fn ipfix_record_len() -> usize {
    IPFIX_FIELDS.iter().map(|(_, len)| usize::from(*len)).sum()
}

fn push_ipfix_header<B: BufMut>(
    buf: &mut B,
    length: u16,
    export_time: u32,
    sequence: u32,
    domain_id: u32,
) {
    buf.put_u16(10);
    buf.put_u16(length);
    buf.put_u32(export_time);
    buf.put_u32(sequence);
    buf.put_u32(domain_id);
}

/// Builds the template-set datagram announcing template 256.
pub fn build_ipfix_template(export_time: u32, sequence: u32, domain_id: u32) -> Vec<u8> {
    let set_len = 4 + 4 + IPFIX_FIELDS.len() * 4;
    let total = IPFIX_HEADER_LEN + set_len;
    let mut buf = BytesMut::with_capacity(total);
    push_ipfix_header(&mut buf, total as u16, export_time, sequence, domain_id);
    buf.put_u16(IPFIX_TEMPLATE_SET_ID);
    buf.put_u16(set_len as u16);
    buf.put_u16(IPFIX_FLOW_TEMPLATE_ID);
    buf.put_u16(IPFIX_FIELDS.len() as u16);
    for (id, len) in IPFIX_FIELDS {
        buf.put_u16(id);
        buf.put_u16(len);
    }
    buf.to_vec()
}

/// Builds a data-set datagram under template 256.
pub fn build_ipfix_data(
    flows: &[FlowRecord],
    export_time: u32,
    sequence: u32,
    domain_id: u32,
) -> Vec<u8> {
    let set_len = 4 + flows.len() * ipfix_record_len();
    let total = IPFIX_HEADER_LEN + set_len;
    let mut buf = BytesMut::with_capacity(total);
    push_ipfix_header(&mut buf, total as u16, export_time, sequence, domain_id);
    buf.put_u16(IPFIX_FLOW_TEMPLATE_ID);
    buf.put_u16(set_len as u16);
    for flow in flows {
        buf.put_slice(&flow.src_addr.octets());
        buf.put_slice(&flow.dst_addr.octets());
        buf.put_u8(flow.protocol);
        buf.put_u16(flow.src_port);
        buf.put_u16(flow.dst_port);
        buf.put_u64(flow.packets);
        buf.put_u64(flow.octets);
        buf.put_u64(u64::from(flow.first_ms));
        buf.put_u64(u64::from(flow.last_ms));
    }
    buf.to_vec()
}
