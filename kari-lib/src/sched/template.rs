//! Immutable per-profile frame templates.
//!
//! Each worker builds one template at startup and replicates it for every
//! batch; nothing on the hot path re-encodes headers.

use bytes::BytesMut;
use rand::{rng, Rng};
use std::net::IpAddr;

use crate::codec::ethernet::{push_ethernet, ETH_HEADER_LEN, VLAN_TAG_LEN};
use crate::codec::ipv4::IPV4_HEADER_LEN;
use crate::codec::ipv6::IPV6_HEADER_LEN;
use crate::codec::mpls::MPLS_LABEL_LEN;
use crate::codec::tcp::{flags, TcpSegment};
use crate::codec::udp::{push_udp, UDP_HEADER_LEN};
use crate::codec::vxlan::{push_vxlan, VXLAN_HEADER_LEN};
use crate::codec::{
    Ipv4Header, Ipv6Header, MplsLabel, PseudoHeader, VlanTag, ETHERTYPE_IPV4, ETHERTYPE_IPV6,
    ETHERTYPE_MPLS, IPPROTO_TCP, IPPROTO_UDP, VXLAN_PORT,
};
use crate::config::{InterfaceConfig, Protocol, TrafficProfile};
use crate::error::{EngineError, Result};

pub const TEMPLATE_SRC_PORT: u16 = 49152;
pub const TEMPLATE_DST_PORT: u16 = 49153;

/// Ethernet floor: no frame may be shorter than this on the wire.
pub const MIN_ETHERNET_FRAME: usize = 64;

fn vlan_tags(profile: &TrafficProfile) -> Vec<VlanTag> {
    match (profile.vlan_outer, profile.vlan_inner) {
        (Some(outer), Some(inner)) => vec![VlanTag::dot1ad(outer, 0), VlanTag::dot1q(inner, 0)],
        (Some(outer), None) => vec![VlanTag::dot1q(outer, 0)],
        (None, Some(inner)) => vec![VlanTag::dot1q(inner, 0)],
        (None, None) => Vec::new(),
    }
}

/// Header bytes consumed by the profile's encapsulation stack.
pub fn encap_overhead(profile: &TrafficProfile) -> usize {
    let tags = match profile.protocol {
        Protocol::Qinq => 2,
        _ => vlan_tags(profile).len(),
    };
    let base = ETH_HEADER_LEN + tags * VLAN_TAG_LEN;
    match profile.protocol {
        Protocol::Ipv4 | Protocol::Udp | Protocol::Http | Protocol::Imix | Protocol::Qinq => {
            base + IPV4_HEADER_LEN + UDP_HEADER_LEN
        }
        Protocol::Ipv6 => base + IPV6_HEADER_LEN + UDP_HEADER_LEN,
        Protocol::Mpls => base + MPLS_LABEL_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN,
        Protocol::Vxlan => {
            base + IPV4_HEADER_LEN
                + UDP_HEADER_LEN
                + VXLAN_HEADER_LEN
                + ETH_HEADER_LEN
                + IPV4_HEADER_LEN
                + UDP_HEADER_LEN
        }
        Protocol::Tcp => base + IPV4_HEADER_LEN + 20,
    }
}

/// Minimum admissible frame size for the profile's encapsulation stack.
pub fn min_frame_len(profile: &TrafficProfile) -> usize {
    MIN_ETHERNET_FRAME.max(encap_overhead(profile))
}

fn ipv4_endpoints(
    profile: &TrafficProfile,
    src_cfg: &InterfaceConfig,
) -> Result<(std::net::Ipv4Addr, std::net::Ipv4Addr)> {
    let src = match profile.src_ip {
        Some(IpAddr::V4(addr)) => addr,
        Some(IpAddr::V6(_)) => {
            return Err(EngineError::Config(format!(
                "profile {} mixes an IPv6 source with an IPv4 variant",
                profile.name
            )))
        }
        None => src_cfg.ip_address.ok_or_else(|| {
            EngineError::Config(format!(
                "interface {} has no IPv4 address for profile {}",
                src_cfg.name, profile.name
            ))
        })?,
    };
    let dst = match profile.dst_ip {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => {
            return Err(EngineError::Config(format!(
                "profile {} needs an IPv4 destination",
                profile.name
            )))
        }
    };
    Ok((src, dst))
}

fn payload_fill(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xff) as u8).collect()
}

/// Builds the profile's immutable template frame of exactly
/// `profile.packet_size` bytes.
pub fn build_template(
    profile: &TrafficProfile,
    src_cfg: &InterfaceConfig,
    dst_cfg: &InterfaceConfig,
) -> Result<Vec<u8>> {
    let overhead = encap_overhead(profile);
    if profile.packet_size < min_frame_len(profile) {
        return Err(EngineError::Config(format!(
            "profile {}: frame size {} below encapsulation minimum {}",
            profile.name,
            profile.packet_size,
            min_frame_len(profile)
        )));
    }
    let payload_len = profile.packet_size - overhead;
    let payload = payload_fill(payload_len);
    let src_mac = src_cfg.mac_address;
    let dst_mac = dst_cfg.mac_address;

    let mut buf = BytesMut::with_capacity(profile.packet_size);
    match profile.protocol {
        Protocol::Ipv4 | Protocol::Udp | Protocol::Http | Protocol::Imix => {
            let (src, dst) = ipv4_endpoints(profile, src_cfg)?;
            push_ethernet(&mut buf, dst_mac, src_mac, &vlan_tags(profile), ETHERTYPE_IPV4);
            Ipv4Header::new(src, dst, IPPROTO_UDP, UDP_HEADER_LEN + payload_len)
                .with_dscp(profile.dscp)
                .with_identification(rng().random())
                .push(&mut buf);
            push_udp(
                &mut buf,
                TEMPLATE_SRC_PORT,
                TEMPLATE_DST_PORT,
                &payload,
                &PseudoHeader::V4 { src, dst },
            );
        }
        Protocol::Qinq => {
            let (src, dst) = ipv4_endpoints(profile, src_cfg)?;
            let tags = vec![
                VlanTag::dot1ad(profile.vlan_outer.unwrap_or(100), 0),
                VlanTag::dot1q(profile.vlan_inner.unwrap_or(200), 0),
            ];
            push_ethernet(&mut buf, dst_mac, src_mac, &tags, ETHERTYPE_IPV4);
            Ipv4Header::new(src, dst, IPPROTO_UDP, UDP_HEADER_LEN + payload_len)
                .with_dscp(profile.dscp)
                .with_identification(rng().random())
                .push(&mut buf);
            push_udp(
                &mut buf,
                TEMPLATE_SRC_PORT,
                TEMPLATE_DST_PORT,
                &payload,
                &PseudoHeader::V4 { src, dst },
            );
        }
        Protocol::Ipv6 => {
            let src = match profile.src_ip {
                Some(IpAddr::V6(addr)) => addr,
                _ => src_cfg.ipv6_address.ok_or_else(|| {
                    EngineError::Config(format!(
                        "interface {} has no IPv6 address for profile {}",
                        src_cfg.name, profile.name
                    ))
                })?,
            };
            let dst = match profile.dst_ip {
                IpAddr::V6(addr) => addr,
                IpAddr::V4(_) => {
                    return Err(EngineError::Config(format!(
                        "profile {} needs an IPv6 destination",
                        profile.name
                    )))
                }
            };
            push_ethernet(&mut buf, dst_mac, src_mac, &vlan_tags(profile), ETHERTYPE_IPV6);
            Ipv6Header::new(src, dst, IPPROTO_UDP, UDP_HEADER_LEN + payload_len)
                .with_dscp(profile.dscp)
                .push(&mut buf);
            push_udp(
                &mut buf,
                TEMPLATE_SRC_PORT,
                TEMPLATE_DST_PORT,
                &payload,
                &PseudoHeader::V6 { src, dst },
            );
        }
        Protocol::Mpls => {
            let (src, dst) = ipv4_endpoints(profile, src_cfg)?;
            push_ethernet(&mut buf, dst_mac, src_mac, &vlan_tags(profile), ETHERTYPE_MPLS);
            MplsLabel::new(profile.mpls_label.unwrap_or(100)).push(&mut buf);
            Ipv4Header::new(src, dst, IPPROTO_UDP, UDP_HEADER_LEN + payload_len)
                .with_dscp(profile.dscp)
                .with_identification(rng().random())
                .push(&mut buf);
            push_udp(
                &mut buf,
                TEMPLATE_SRC_PORT,
                TEMPLATE_DST_PORT,
                &payload,
                &PseudoHeader::V4 { src, dst },
            );
        }
        Protocol::Vxlan => {
            let (src, dst) = ipv4_endpoints(profile, src_cfg)?;
            let inner_len = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload_len;
            let udp_len = UDP_HEADER_LEN + VXLAN_HEADER_LEN + inner_len;
            push_ethernet(&mut buf, dst_mac, src_mac, &vlan_tags(profile), ETHERTYPE_IPV4);
            Ipv4Header::new(src, dst, IPPROTO_UDP, udp_len)
                .with_dscp(profile.dscp)
                .with_identification(rng().random())
                .push(&mut buf);

            // Inner frame first, so the outer UDP checksum covers it.
            let mut inner = BytesMut::with_capacity(VXLAN_HEADER_LEN + inner_len);
            push_vxlan(&mut inner, profile.vni.unwrap_or(100));
            push_ethernet(&mut inner, dst_mac, src_mac, &[], ETHERTYPE_IPV4);
            Ipv4Header::new(src, dst, IPPROTO_UDP, UDP_HEADER_LEN + payload_len)
                .with_identification(rng().random())
                .push(&mut inner);
            push_udp(
                &mut inner,
                TEMPLATE_SRC_PORT,
                TEMPLATE_DST_PORT,
                &payload,
                &PseudoHeader::V4 { src, dst },
            );

            push_udp(
                &mut buf,
                TEMPLATE_SRC_PORT,
                VXLAN_PORT,
                &inner,
                &PseudoHeader::V4 { src, dst },
            );
        }
        Protocol::Tcp => {
            let (src, dst) = ipv4_endpoints(profile, src_cfg)?;
            push_ethernet(&mut buf, dst_mac, src_mac, &vlan_tags(profile), ETHERTYPE_IPV4);
            Ipv4Header::new(src, dst, IPPROTO_TCP, 20 + payload_len)
                .with_dscp(profile.dscp)
                .with_identification(rng().random())
                .push(&mut buf);
            TcpSegment {
                src_port: TEMPLATE_SRC_PORT,
                dst_port: TEMPLATE_DST_PORT,
                seq: rng().random(),
                ack: 0,
                flags: flags::PSH | flags::ACK,
                window: 65535,
                options: &[],
                payload: &payload,
            }
            .push(&mut buf, &PseudoHeader::V4 { src, dst });
        }
    }

    debug_assert_eq!(buf.len(), profile.packet_size);
    Ok(buf.to_vec())
}
