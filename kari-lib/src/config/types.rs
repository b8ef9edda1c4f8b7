use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::codec::MacAddr;

/// Physical classification of a port.
///
/// The `Sfp10gDpdk` variant requests the kernel-bypass backend; when the
/// bypass runtime is unavailable at init the interface is reclassified to
/// `Sfp10gOptimized` and served by the raw-socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    CopperStandard,
    CopperOptimized,
    Sfp10gDpdk,
    Sfp10gOptimized,
}

impl InterfaceType {
    /// Nominal line rate in Mb/s for this port class.
    pub fn nominal_rate_mbps(&self) -> u32 {
        match self {
            InterfaceType::CopperStandard | InterfaceType::CopperOptimized => 1_000,
            InterfaceType::Sfp10gDpdk | InterfaceType::Sfp10gOptimized => 10_000,
        }
    }

    pub fn wants_acceleration(&self) -> bool {
        matches!(self, InterfaceType::Sfp10gDpdk)
    }
}

/// Configuration for a single network port.
///
/// Created at admission, mutated only by discovery refresh, destroyed on
/// teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    /// OS device name, e.g. "eth1".
    pub name: String,
    pub mac_address: MacAddr,
    pub interface_type: InterfaceType,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6_address: Option<Ipv6Addr>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub vlan_id: Option<u16>,
    /// PCI path for bypass-capable ports, e.g. "0000:03:00.0".
    #[serde(default)]
    pub pci_address: Option<String>,
    #[serde(default)]
    pub numa_node: u16,
    /// Advertised nominal rate; falls back to the port class when absent.
    #[serde(default)]
    pub speed_mbps: Option<u32>,
}

impl InterfaceConfig {
    pub fn nominal_rate_mbps(&self) -> u32 {
        self.speed_mbps
            .unwrap_or_else(|| self.interface_type.nominal_rate_mbps())
    }
}

/// Frame synthesis variant for a traffic profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ipv4,
    Ipv6,
    Mpls,
    Vxlan,
    Qinq,
    Tcp,
    Udp,
    Http,
    Imix,
}

/// Per-profile impairment settings. All percentages are 0..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ImpairmentConfig {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub burst_loss_percent: f64,
    /// Frames dropped per burst once burst loss triggers.
    pub burst_loss_length: u32,
    pub reorder_percent: f64,
    /// How many queued frames ahead a reordered frame is swapped with.
    pub reorder_gap: usize,
    pub duplicate_percent: f64,
    pub corruption_percent: f64,
    /// Byte offset of the single flipped bit.
    pub corruption_offset: usize,
    /// 0 disables the token-bucket rate limit.
    pub bandwidth_limit_bps: u64,
}

impl Default for ImpairmentConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_percent: 0.0,
            burst_loss_percent: 0.0,
            burst_loss_length: 3,
            reorder_percent: 0.0,
            reorder_gap: 3,
            duplicate_percent: 0.0,
            corruption_percent: 0.0,
            corruption_offset: 0,
            bandwidth_limit_bps: 0,
        }
    }
}

impl ImpairmentConfig {
    /// True when every knob is neutral: the pipeline is then order-preserving
    /// and non-buffering.
    pub fn is_passthrough(&self) -> bool {
        self.latency_ms == 0.0
            && self.jitter_ms == 0.0
            && self.loss_percent == 0.0
            && self.burst_loss_percent == 0.0
            && self.reorder_percent == 0.0
            && self.duplicate_percent == 0.0
            && self.corruption_percent == 0.0
            && self.bandwidth_limit_bps == 0
    }

    pub fn needs_delay_queue(&self) -> bool {
        self.latency_ms > 0.0 || self.jitter_ms > 0.0
    }

    /// Named presets modeled after common link conditions.
    pub fn preset(name: &str) -> Option<Self> {
        let mut cfg = Self::default();
        match name {
            "lan" => {
                cfg.latency_ms = 1.0;
                cfg.jitter_ms = 0.5;
                cfg.loss_percent = 0.001;
            }
            "broadband_good" => {
                cfg.latency_ms = 20.0;
                cfg.jitter_ms = 5.0;
                cfg.loss_percent = 0.1;
                cfg.reorder_percent = 0.01;
            }
            "broadband_poor" => {
                cfg.latency_ms = 100.0;
                cfg.jitter_ms = 30.0;
                cfg.loss_percent = 2.0;
                cfg.reorder_percent = 0.5;
                cfg.burst_loss_percent = 1.0;
            }
            "satellite" => {
                cfg.latency_ms = 600.0;
                cfg.jitter_ms = 50.0;
                cfg.loss_percent = 0.5;
                cfg.reorder_percent = 0.1;
            }
            "mobile_3g" => {
                cfg.latency_ms = 200.0;
                cfg.jitter_ms = 100.0;
                cfg.loss_percent = 5.0;
                cfg.reorder_percent = 2.0;
                cfg.burst_loss_percent = 2.0;
            }
            "mobile_4g" => {
                cfg.latency_ms = 50.0;
                cfg.jitter_ms = 20.0;
                cfg.loss_percent = 1.0;
                cfg.reorder_percent = 0.5;
            }
            "mobile_5g" => {
                cfg.latency_ms = 10.0;
                cfg.jitter_ms = 5.0;
                cfg.loss_percent = 0.1;
                cfg.reorder_percent = 0.01;
            }
            "congested" => {
                cfg.latency_ms = 500.0;
                cfg.jitter_ms = 200.0;
                cfg.loss_percent = 10.0;
                cfg.reorder_percent = 5.0;
                cfg.burst_loss_percent = 5.0;
            }
            _ => return None,
        }
        Some(cfg)
    }
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    128
}

/// Traffic generation profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficProfile {
    /// Unique name; also the registry key.
    pub name: String,
    pub src_interface: String,
    pub dst_interface: String,
    pub dst_ip: IpAddr,
    /// Overrides the source interface's address when set.
    #[serde(default)]
    pub src_ip: Option<IpAddr>,
    /// Target rate in Mb/s.
    pub bandwidth_mbps: f64,
    /// On-wire frame size in bytes, Ethernet header included.
    pub packet_size: usize,
    pub protocol: Protocol,
    /// DiffServ code point, 0..=63.
    #[serde(default)]
    pub dscp: u8,
    #[serde(default)]
    pub vlan_outer: Option<u16>,
    #[serde(default)]
    pub vlan_inner: Option<u16>,
    /// VXLAN network identifier (24 bit).
    #[serde(default)]
    pub vni: Option<u32>,
    #[serde(default)]
    pub mpls_label: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Named impairment preset (e.g. "mobile_4g") applied at admission when
    /// no explicit impairment record is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impairment_preset: Option<String>,
    #[serde(default)]
    pub impairments: ImpairmentConfig,
    #[serde(default = "default_true")]
    pub use_hardware_timestamps: bool,
    /// Upper bound on the rate-derived batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub zero_copy: bool,
}
