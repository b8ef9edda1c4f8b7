use kari_lib::codec::ethernet::parse_link_layer;
use kari_lib::codec::mpls::parse_stack;
use kari_lib::codec::tcp::TcpSegmentView;
use kari_lib::codec::udp::parse_udp;
use kari_lib::codec::vxlan::parse_vxlan;
use kari_lib::codec::{Ipv4Header, ETHERTYPE_IPV4, ETHERTYPE_MPLS, VXLAN_PORT};
use kari_lib::config::{ImpairmentConfig, InterfaceConfig, InterfaceType, Protocol, TrafficProfile};
use kari_lib::iface::{Interface, PortIo};
use kari_lib::sched::{batch_size_for, build_template, min_frame_len, worker, ProfileStats};
use kari_lib::PacketPool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn iface_cfg(name: &str, mac: &str, ip: [u8; 4]) -> InterfaceConfig {
    InterfaceConfig {
        name: name.to_string(),
        mac_address: mac.parse().unwrap(),
        interface_type: InterfaceType::CopperOptimized,
        ip_address: Some(ip.into()),
        subnet_mask: Some([255, 255, 255, 0].into()),
        ipv6_address: Some("fe80::1".parse().unwrap()),
        gateway: None,
        vlan_id: None,
        pci_address: None,
        numa_node: 0,
        speed_mbps: None,
    }
}

fn profile(protocol: Protocol, packet_size: usize) -> TrafficProfile {
    TrafficProfile {
        name: "p1".to_string(),
        src_interface: "eth1".to_string(),
        dst_interface: "eth2".to_string(),
        dst_ip: "10.0.0.2".parse().unwrap(),
        src_ip: None,
        bandwidth_mbps: 100.0,
        packet_size,
        protocol,
        dscp: 0,
        vlan_outer: None,
        vlan_inner: None,
        vni: None,
        mpls_label: None,
        enabled: true,
        impairment_preset: None,
        impairments: ImpairmentConfig::default(),
        use_hardware_timestamps: true,
        batch_size: 128,
        zero_copy: true,
    }
}

#[test]
fn batch_ladder_follows_rate() {
    assert_eq!(batch_size_for(200_000.0, 128), 128);
    assert_eq!(batch_size_for(50_000.0, 128), 64);
    assert_eq!(batch_size_for(5_000.0, 128), 32);
    assert_eq!(batch_size_for(500.0, 128), 32);
    // The profile ceiling wins over the rate ladder.
    assert_eq!(batch_size_for(200_000.0, 16), 16);
    assert_eq!(batch_size_for(200_000.0, 0), 1);
}

#[test]
fn minimum_frame_sizes_per_encapsulation() {
    assert_eq!(min_frame_len(&profile(Protocol::Ipv4, 200)), 64);
    assert_eq!(min_frame_len(&profile(Protocol::Ipv6, 200)), 64);
    assert_eq!(min_frame_len(&profile(Protocol::Qinq, 200)), 64);
    assert_eq!(min_frame_len(&profile(Protocol::Mpls, 200)), 64);
    // VXLAN carries a full inner frame, pushing the floor past 64.
    assert_eq!(min_frame_len(&profile(Protocol::Vxlan, 200)), 92);

    let mut tagged = profile(Protocol::Ipv4, 200);
    tagged.vlan_outer = Some(10);
    tagged.vlan_inner = Some(20);
    assert_eq!(min_frame_len(&tagged), 64);
}

#[test]
fn template_below_minimum_is_rejected() {
    let src = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let p = profile(Protocol::Vxlan, 80);
    assert!(build_template(&p, &src, &dst).is_err());
}

#[test]
fn ipv4_template_carries_dscp_and_checksums() {
    let src = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let mut p = profile(Protocol::Ipv4, 200);
    p.dscp = 46;
    let frame = build_template(&p, &src, &dst).unwrap();
    assert_eq!(frame.len(), 200);

    let link = parse_link_layer(&frame).unwrap();
    assert_eq!(link.ethertype, ETHERTYPE_IPV4);
    assert_eq!(link.header.src.to_string(), "00:11:22:33:44:01");
    assert_eq!(link.header.dst.to_string(), "00:11:22:33:44:02");

    // Voice profile expectation: DSCP 46 means a 0xB8 ToS octet.
    assert_eq!(frame[15], 0xB8);
    let ip_bytes = &frame[link.payload_offset..];
    assert!(Ipv4Header::verify_checksum(ip_bytes).unwrap());
    let (ip, ihl) = Ipv4Header::parse(ip_bytes).unwrap();
    assert_eq!(ip.dscp, 46);
    assert_eq!(usize::from(ip.total_len), 200 - 14);
    let (udp, _) = parse_udp(&ip_bytes[ihl..]).unwrap();
    assert_eq!(usize::from(udp.length), usize::from(ip.total_len) - 20);
}

#[test]
fn vlan_template_stacks_tags() {
    let src = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let mut p = profile(Protocol::Ipv4, 200);
    p.vlan_outer = Some(100);
    p.vlan_inner = Some(200);
    let frame = build_template(&p, &src, &dst).unwrap();
    let link = parse_link_layer(&frame).unwrap();
    assert_eq!(link.tags.len(), 2);
    assert_eq!(link.tags[0].vid, 100);
    assert_eq!(link.tags[1].vid, 200);
    assert_eq!(link.payload_offset, 22);
    assert_eq!(frame.len(), 200);
}

#[test]
fn mpls_template_has_bottom_of_stack_label() {
    let src = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let mut p = profile(Protocol::Mpls, 256);
    p.mpls_label = Some(777);
    let frame = build_template(&p, &src, &dst).unwrap();
    let link = parse_link_layer(&frame).unwrap();
    assert_eq!(link.ethertype, ETHERTYPE_MPLS);
    let (labels, used) = parse_stack(&frame[link.payload_offset..]).unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].label, 777);
    assert!(labels[0].bos);
    let ip_bytes = &frame[link.payload_offset + used..];
    assert!(Ipv4Header::verify_checksum(ip_bytes).unwrap());
}

#[test]
fn vxlan_template_encapsulates_inner_ethernet() {
    let src = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let mut p = profile(Protocol::Vxlan, 300);
    p.vni = Some(4096);
    let frame = build_template(&p, &src, &dst).unwrap();
    assert_eq!(frame.len(), 300);

    let link = parse_link_layer(&frame).unwrap();
    let ip_bytes = &frame[link.payload_offset..];
    let (outer_ip, ihl) = Ipv4Header::parse(ip_bytes).unwrap();
    assert_eq!(outer_ip.protocol, 17);
    let (outer_udp, udp_len) = parse_udp(&ip_bytes[ihl..]).unwrap();
    assert_eq!(outer_udp.dst_port, VXLAN_PORT);

    let vxlan_bytes = &ip_bytes[ihl + udp_len..];
    let (vni, vxlan_len) = parse_vxlan(vxlan_bytes).unwrap();
    assert_eq!(vni, 4096);
    let inner = parse_link_layer(&vxlan_bytes[vxlan_len..]).unwrap();
    assert_eq!(inner.ethertype, ETHERTYPE_IPV4);
}

#[test]
fn tcp_template_is_parseable() {
    let src = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let frame = build_template(&profile(Protocol::Tcp, 128), &src, &dst).unwrap();
    let link = parse_link_layer(&frame).unwrap();
    let ip_bytes = &frame[link.payload_offset..];
    let (ip, ihl) = Ipv4Header::parse(ip_bytes).unwrap();
    assert_eq!(ip.protocol, 6);
    let view = TcpSegmentView::parse(&ip_bytes[ihl..]).unwrap();
    assert!(view.has(kari_lib::codec::tcp::flags::PSH));
}

#[derive(Default)]
struct CountingPort {
    frames: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl PortIo for CountingPort {
    fn send_batch(&mut self, frames: &[&[u8]]) -> usize {
        self.frames.fetch_add(frames.len() as u64, Ordering::Relaxed);
        let bytes: u64 = frames.iter().map(|f| f.len() as u64).sum();
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        frames.len()
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Option<usize> {
        None
    }

    fn tx_timestamp(&mut self) -> Option<u64> {
        None
    }
}

#[test]
fn worker_paces_to_the_target_rate() {
    let src_cfg = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst_cfg = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let sent = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));
    let port = CountingPort {
        frames: Arc::clone(&sent),
        bytes: Arc::clone(&bytes),
    };
    let iface = Interface::with_port(src_cfg.clone(), Box::new(port));

    // 8 Mb/s at 1000-byte frames is 1000 pps.
    let mut p = profile(Protocol::Ipv4, 1000);
    p.bandwidth_mbps = 8.0;
    let template = build_template(&p, &src_cfg, &dst_cfg).unwrap();
    let pool = PacketPool::new(1024, 2048).unwrap();
    let stats = Arc::new(ProfileStats::default());

    let handle = worker::spawn(
        p,
        iface,
        pool,
        Arc::clone(&stats),
        Arc::new(AtomicBool::new(true)),
        template,
    );
    std::thread::sleep(Duration::from_secs(1));
    handle.stop();

    let frames = sent.load(Ordering::Relaxed);
    assert!(
        (600..=1500).contains(&frames),
        "frames sent in 1s = {frames}"
    );
    // Emitted bytes track rate * time within one batch of slack.
    let byte_count = bytes.load(Ordering::Relaxed);
    assert!(byte_count >= 600 * 1000, "bytes = {byte_count}");
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.succeeded, frames);
}

#[test]
fn worker_stops_within_deadline() {
    let src_cfg = iface_cfg("eth1", "00:11:22:33:44:01", [10, 0, 0, 1]);
    let dst_cfg = iface_cfg("eth2", "00:11:22:33:44:02", [10, 0, 0, 2]);
    let iface = Interface::with_port(src_cfg.clone(), Box::new(CountingPort::default()));
    let mut p = profile(Protocol::Ipv4, 200);
    p.bandwidth_mbps = 1.0;
    let template = build_template(&p, &src_cfg, &dst_cfg).unwrap();
    let pool = PacketPool::new(256, 2048).unwrap();

    let handle = worker::spawn(
        p,
        iface,
        pool,
        Arc::new(ProfileStats::default()),
        Arc::new(AtomicBool::new(true)),
        template,
    );
    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    handle.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
}
