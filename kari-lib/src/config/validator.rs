use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

use super::types::{InterfaceConfig, TrafficProfile};
use crate::error::{EngineError, Result};
use crate::sched::template;

pub fn validate_interface(cfg: &InterfaceConfig) -> Result<()> {
    if cfg.name.trim().is_empty() {
        return Err(EngineError::Config("interface name cannot be empty".into()));
    }
    if cfg.speed_mbps == Some(0) {
        return Err(EngineError::Config(format!(
            "interface {}: speed_mbps must be > 0",
            cfg.name
        )));
    }
    Ok(())
}

/// Admission checks for a profile against the admitted interfaces.
///
/// A target rate above the source's nominal rate is warned about, never
/// rejected.
pub fn validate_profile(
    profile: &TrafficProfile,
    interfaces: &HashMap<String, InterfaceConfig>,
) -> Result<()> {
    let src = interfaces.get(&profile.src_interface).ok_or_else(|| {
        EngineError::UnknownInterface(profile.src_interface.clone())
    })?;
    if !interfaces.contains_key(&profile.dst_interface) {
        return Err(EngineError::UnknownInterface(profile.dst_interface.clone()));
    }
    if profile.dscp > 63 {
        return Err(EngineError::Config(format!(
            "profile {}: dscp {} out of range 0..=63",
            profile.name, profile.dscp
        )));
    }
    if profile.bandwidth_mbps <= 0.0 {
        return Err(EngineError::Config(format!(
            "profile {}: bandwidth must be > 0",
            profile.name
        )));
    }
    let min = template::min_frame_len(profile);
    if profile.packet_size < min {
        return Err(EngineError::Config(format!(
            "profile {}: frame size {} below encapsulation minimum {}",
            profile.name, profile.packet_size, min
        )));
    }
    if profile.packet_size > crate::pool::DEFAULT_BUF_SIZE {
        return Err(EngineError::Config(format!(
            "profile {}: frame size {} exceeds the {}-byte buffer",
            profile.name,
            profile.packet_size,
            crate::pool::DEFAULT_BUF_SIZE
        )));
    }
    if let Some(vni) = profile.vni {
        if vni > 0x00ff_ffff {
            return Err(EngineError::Config(format!(
                "profile {}: vni {} exceeds 24 bits",
                profile.name, vni
            )));
        }
    }

    let nominal = f64::from(src.nominal_rate_mbps());
    if profile.bandwidth_mbps > nominal {
        warn!(
            profile = %profile.name,
            rate_mbps = profile.bandwidth_mbps,
            nominal_mbps = nominal,
            "target rate exceeds the source interface's nominal rate"
        );
    }

    if let (Some(ip), Some(mask), IpAddr::V4(dst)) =
        (src.ip_address, src.subnet_mask, profile.dst_ip)
    {
        if let Ok(net) = Ipv4Net::with_netmask(ip, mask) {
            if !net.contains(&dst) {
                warn!(
                    profile = %profile.name,
                    %dst,
                    subnet = %net,
                    "destination is outside the source interface's subnet"
                );
            }
        }
    }
    Ok(())
}
