//! BGP-4 message codec per RFC 4271, capabilities per RFC 5492, 4-byte ASN
//! per RFC 6793.

use bytes::BufMut;
use std::net::Ipv4Addr;

use super::{need, CodecError, CodecResult};

pub const MARKER: [u8; 16] = [0xff; 16];
pub const HEADER_LEN: usize = 19;

const FLAG_OPTIONAL: u8 = 0x80;
const FLAG_TRANSITIVE: u8 = 0x40;
const FLAG_PARTIAL: u8 = 0x20;
const FLAG_EXTENDED_LEN: u8 = 0x10;

pub const ATTR_ORIGIN: u8 = 1;
pub const ATTR_AS_PATH: u8 = 2;
pub const ATTR_NEXT_HOP: u8 = 3;
pub const ATTR_MULTI_EXIT_DISC: u8 = 4;
pub const ATTR_LOCAL_PREF: u8 = 5;

pub const ORIGIN_IGP: u8 = 0;

const AS_SEQUENCE: u8 = 2;

const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_ROUTE_REFRESH: u8 = 2;
const CAP_FOUR_BYTE_ASN: u8 = 65;

const PARAM_CAPABILITIES: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

impl MessageType {
    fn from_u8(v: u8) -> CodecResult<Self> {
        Ok(match v {
            1 => MessageType::Open,
            2 => MessageType::Update,
            3 => MessageType::Notification,
            4 => MessageType::Keepalive,
            other => {
                return Err(CodecError::Unsupported {
                    what: "bgp message type",
                    value: u32::from(other),
                })
            }
        })
    }
}

/// Frames `body` with the 16-byte marker, length, and type.
pub fn push_message<B: BufMut>(buf: &mut B, message_type: MessageType, body: &[u8]) {
    buf.put_slice(&MARKER);
    buf.put_u16((HEADER_LEN + body.len()) as u16);
    buf.put_u8(message_type as u8);
    buf.put_slice(body);
}

/// Splits one message off `data`; returns type, body, and bytes consumed.
pub fn parse_message(data: &[u8]) -> CodecResult<(MessageType, &[u8], usize)> {
    need(data, HEADER_LEN, "bgp header")?;
    if data[..16] != MARKER {
        return Err(CodecError::Invalid("bgp marker"));
    }
    let length = usize::from(u16::from_be_bytes([data[16], data[17]]));
    if length < HEADER_LEN {
        return Err(CodecError::Invalid("bgp length"));
    }
    if length > data.len() {
        return Err(CodecError::LengthOverrun {
            what: "bgp message",
            field: length,
            outer: data.len(),
        });
    }
    let message_type = MessageType::from_u8(data[18])?;
    Ok((message_type, &data[HEADER_LEN..length], length))
}

/// Negotiable session capabilities carried in OPEN optional parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Multiprotocol IPv4/unicast (AFI=1, SAFI=1).
    MultiprotocolIpv4Unicast,
    RouteRefresh,
    FourByteAsn(u32),
}

impl Capability {
    fn push(&self, out: &mut Vec<u8>) {
        match self {
            Capability::MultiprotocolIpv4Unicast => {
                out.extend_from_slice(&[CAP_MULTIPROTOCOL, 4, 0, 1, 0, 1]);
            }
            Capability::RouteRefresh => out.extend_from_slice(&[CAP_ROUTE_REFRESH, 0]),
            Capability::FourByteAsn(asn) => {
                out.extend_from_slice(&[CAP_FOUR_BYTE_ASN, 4]);
                out.extend_from_slice(&asn.to_be_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    /// Two-byte ASN on the wire; AS_TRANS (23456) when the real ASN needs the
    /// 4-byte capability.
    pub asn: u16,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut caps = Vec::new();
        for capability in &self.capabilities {
            capability.push(&mut caps);
        }
        let mut body = Vec::with_capacity(10 + caps.len() + 2);
        body.push(self.version);
        body.extend_from_slice(&self.asn.to_be_bytes());
        body.extend_from_slice(&self.hold_time.to_be_bytes());
        body.extend_from_slice(&self.router_id.octets());
        if caps.is_empty() {
            body.push(0);
        } else {
            body.push((caps.len() + 2) as u8);
            body.push(PARAM_CAPABILITIES);
            body.push(caps.len() as u8);
            body.extend_from_slice(&caps);
        }
        body
    }

    pub fn parse(body: &[u8]) -> CodecResult<Self> {
        need(body, 10, "bgp open")?;
        let opt_len = usize::from(body[9]);
        need(body, 10 + opt_len, "bgp open parameters")?;
        let mut capabilities = Vec::new();
        let mut params = &body[10..10 + opt_len];
        while params.len() >= 2 {
            let param_type = params[0];
            let param_len = usize::from(params[1]);
            need(params, 2 + param_len, "bgp open parameter")?;
            if param_type == PARAM_CAPABILITIES {
                let mut caps = &params[2..2 + param_len];
                while caps.len() >= 2 {
                    let code = caps[0];
                    let len = usize::from(caps[1]);
                    need(caps, 2 + len, "bgp capability")?;
                    let value = &caps[2..2 + len];
                    match (code, len) {
                        (CAP_MULTIPROTOCOL, 4) if value == [0, 1, 0, 1] => {
                            capabilities.push(Capability::MultiprotocolIpv4Unicast);
                        }
                        (CAP_ROUTE_REFRESH, 0) => capabilities.push(Capability::RouteRefresh),
                        (CAP_FOUR_BYTE_ASN, 4) => {
                            capabilities.push(Capability::FourByteAsn(u32::from_be_bytes([
                                value[0], value[1], value[2], value[3],
                            ])));
                        }
                        _ => {}
                    }
                    caps = &caps[2 + len..];
                }
            }
            params = &params[2 + param_len..];
        }
        Ok(Self {
            version: body[0],
            asn: u16::from_be_bytes([body[1], body[2]]),
            hold_time: u16::from_be_bytes([body[3], body[4]]),
            router_id: Ipv4Addr::new(body[5], body[6], body[7], body[8]),
            capabilities,
        })
    }
}

/// An IPv4 prefix packed as (length-in-bits, ceil(length/8) octets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Prefix {
    pub addr: Ipv4Addr,
    pub len: u8,
}

impl Prefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> Self {
        Self { addr, len }
    }

    fn push(&self, out: &mut Vec<u8>) {
        out.push(self.len);
        let octets = self.addr.octets();
        out.extend_from_slice(&octets[..usize::from(self.len).div_ceil(8)]);
    }

    fn parse(data: &[u8]) -> CodecResult<(Self, usize)> {
        need(data, 1, "nlri prefix length")?;
        let len = data[0];
        if len > 32 {
            return Err(CodecError::Invalid("nlri prefix length"));
        }
        let octet_count = usize::from(len).div_ceil(8);
        need(data, 1 + octet_count, "nlri prefix")?;
        let mut octets = [0u8; 4];
        octets[..octet_count].copy_from_slice(&data[1..1 + octet_count]);
        Ok((
            Self {
                addr: Ipv4Addr::from(octets),
                len,
            },
            1 + octet_count,
        ))
    }
}

/// A path attribute in wire form: flags, type code, opaque value.
///
/// Typed constructors cover the attributes the session emits; the extended
/// length flag is derived from the value size when encoding and preserved
/// when parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAttribute {
    pub flags: u8,
    pub type_code: u8,
    pub value: Vec<u8>,
}

impl PathAttribute {
    pub fn origin(origin: u8) -> Self {
        Self {
            flags: FLAG_TRANSITIVE,
            type_code: ATTR_ORIGIN,
            value: vec![origin],
        }
    }

    /// AS_SEQUENCE of `asns`, each encoded in two or four bytes.
    pub fn as_path(asns: &[u32], four_byte: bool) -> Self {
        let mut value = Vec::with_capacity(2 + asns.len() * if four_byte { 4 } else { 2 });
        if !asns.is_empty() {
            value.push(AS_SEQUENCE);
            value.push(asns.len() as u8);
            for asn in asns {
                if four_byte {
                    value.extend_from_slice(&asn.to_be_bytes());
                } else {
                    value.extend_from_slice(&(*asn as u16).to_be_bytes());
                }
            }
        }
        Self {
            flags: FLAG_TRANSITIVE,
            type_code: ATTR_AS_PATH,
            value,
        }
    }

    pub fn next_hop(addr: Ipv4Addr) -> Self {
        Self {
            flags: FLAG_TRANSITIVE,
            type_code: ATTR_NEXT_HOP,
            value: addr.octets().to_vec(),
        }
    }

    pub fn local_pref(pref: u32) -> Self {
        Self {
            flags: FLAG_TRANSITIVE,
            type_code: ATTR_LOCAL_PREF,
            value: pref.to_be_bytes().to_vec(),
        }
    }

    pub fn is_optional(&self) -> bool {
        self.flags & FLAG_OPTIONAL != 0
    }

    pub fn is_transitive(&self) -> bool {
        self.flags & FLAG_TRANSITIVE != 0
    }

    pub fn is_partial(&self) -> bool {
        self.flags & FLAG_PARTIAL != 0
    }

    fn push(&self, out: &mut Vec<u8>) {
        let mut flags = self.flags & !FLAG_EXTENDED_LEN;
        if self.value.len() > 255 {
            flags |= FLAG_EXTENDED_LEN;
        }
        out.push(flags);
        out.push(self.type_code);
        if flags & FLAG_EXTENDED_LEN != 0 {
            out.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
        } else {
            out.push(self.value.len() as u8);
        }
        out.extend_from_slice(&self.value);
    }

    fn parse(data: &[u8]) -> CodecResult<(Self, usize)> {
        need(data, 3, "path attribute header")?;
        let flags = data[0];
        let type_code = data[1];
        let (len, header) = if flags & FLAG_EXTENDED_LEN != 0 {
            need(data, 4, "extended path attribute header")?;
            (usize::from(u16::from_be_bytes([data[2], data[3]])), 4)
        } else {
            (usize::from(data[2]), 3)
        };
        need(data, header + len, "path attribute value")?;
        Ok((
            Self {
                flags: flags & !FLAG_EXTENDED_LEN,
                type_code,
                value: data[header..header + len].to_vec(),
            },
            header + len,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut withdrawn = Vec::new();
        for prefix in &self.withdrawn {
            prefix.push(&mut withdrawn);
        }
        let mut attrs = Vec::new();
        for attribute in &self.attributes {
            attribute.push(&mut attrs);
        }
        let mut body = Vec::with_capacity(4 + withdrawn.len() + attrs.len());
        body.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
        body.extend_from_slice(&withdrawn);
        body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        body.extend_from_slice(&attrs);
        for prefix in &self.nlri {
            prefix.push(&mut body);
        }
        body
    }

    pub fn parse(body: &[u8]) -> CodecResult<Self> {
        need(body, 2, "update withdrawn length")?;
        let withdrawn_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        need(body, 2 + withdrawn_len, "update withdrawn routes")?;
        let mut withdrawn = Vec::new();
        let mut cursor = &body[2..2 + withdrawn_len];
        while !cursor.is_empty() {
            let (prefix, used) = Prefix::parse(cursor)?;
            withdrawn.push(prefix);
            cursor = &cursor[used..];
        }

        let rest = &body[2 + withdrawn_len..];
        need(rest, 2, "update attribute length")?;
        let attrs_len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        need(rest, 2 + attrs_len, "update attributes")?;
        let mut attributes = Vec::new();
        let mut cursor = &rest[2..2 + attrs_len];
        while !cursor.is_empty() {
            let (attribute, used) = PathAttribute::parse(cursor)?;
            attributes.push(attribute);
            cursor = &cursor[used..];
        }

        let mut nlri = Vec::new();
        let mut cursor = &rest[2 + attrs_len..];
        while !cursor.is_empty() {
            let (prefix, used) = Prefix::parse(cursor)?;
            nlri.push(prefix);
            cursor = &cursor[used..];
        }
        Ok(Self {
            withdrawn,
            attributes,
            nlri,
        })
    }
}

/// Notification body; teardown uses Cease (6, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
}

pub const CEASE: Notification = Notification {
    code: 6,
    subcode: 0,
};

impl Notification {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.code, self.subcode]
    }

    pub fn parse(body: &[u8]) -> CodecResult<Self> {
        need(body, 2, "bgp notification")?;
        Ok(Self {
            code: body[0],
            subcode: body[1],
        })
    }
}
