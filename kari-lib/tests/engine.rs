use kari_lib::codec::Ipv4Header;
use kari_lib::config::{
    ImpairmentConfig, InterfaceConfig, InterfaceType, Protocol, TrafficProfile,
};
use kari_lib::engine::{Engine, EngineOptions};
use kari_lib::iface::{Interface, PortIo};
use kari_lib::tcp::TcpEngineConfig;
use serial_test::serial;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One direction of a virtual cable.
#[derive(Default)]
struct Wire {
    frames: Mutex<VecDeque<Vec<u8>>>,
}

impl Wire {
    fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    fn peek_first(&self) -> Option<Vec<u8>> {
        self.frames.lock().unwrap().front().cloned()
    }
}

struct WirePort {
    tx: Arc<Wire>,
    rx: Arc<Wire>,
}

impl PortIo for WirePort {
    fn send_batch(&mut self, frames: &[&[u8]]) -> usize {
        let mut queue = self.tx.frames.lock().unwrap();
        for frame in frames {
            queue.push_back(frame.to_vec());
        }
        frames.len()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let frame = self.rx.frames.lock().unwrap().pop_front()?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Some(n)
    }

    fn tx_timestamp(&mut self) -> Option<u64> {
        None
    }
}

/// Engine wired over an in-memory cable between eth1 and eth2.
fn wired_engine() -> (Arc<Engine>, Arc<Wire>, Arc<Wire>) {
    let a_to_b = Arc::new(Wire::default());
    let b_to_a = Arc::new(Wire::default());
    let forward = Arc::clone(&a_to_b);
    let backward = Arc::clone(&b_to_a);
    let opts = EngineOptions {
        pool_capacity: 1_024,
        pool_buf_size: 2_048,
        tcp: TcpEngineConfig {
            capacity: 64,
            reclaim_scan: 64,
            ..TcpEngineConfig::default()
        },
    };
    let engine = Engine::with_iface_factory(
        opts,
        Box::new(move |cfg| {
            let (tx, rx) = if cfg.name == "eth1" {
                (Arc::clone(&forward), Arc::clone(&backward))
            } else {
                (Arc::clone(&backward), Arc::clone(&forward))
            };
            Ok(Interface::with_port(cfg, Box::new(WirePort { tx, rx })))
        }),
    )
    .unwrap();
    (engine, a_to_b, b_to_a)
}

fn iface(name: &str, last_octet: u8) -> InterfaceConfig {
    InterfaceConfig {
        name: name.to_string(),
        mac_address: format!("00:11:22:33:44:{last_octet:02x}").parse().unwrap(),
        interface_type: InterfaceType::CopperOptimized,
        ip_address: Some([10, 0, 0, last_octet].into()),
        subnet_mask: Some([255, 255, 255, 0].into()),
        ipv6_address: None,
        gateway: None,
        vlan_id: None,
        pci_address: None,
        numa_node: 0,
        speed_mbps: None,
    }
}

fn voice_profile() -> TrafficProfile {
    TrafficProfile {
        name: "voice".to_string(),
        src_interface: "eth1".to_string(),
        dst_interface: "eth2".to_string(),
        dst_ip: "10.0.0.2".parse().unwrap(),
        src_ip: None,
        bandwidth_mbps: 1.0,
        packet_size: 200,
        protocol: Protocol::Ipv4,
        dscp: 46,
        vlan_outer: None,
        vlan_inner: None,
        vni: None,
        mpls_label: None,
        enabled: true,
        impairment_preset: None,
        impairments: ImpairmentConfig::default(),
        use_hardware_timestamps: false,
        batch_size: 32,
        zero_copy: false,
    }
}

#[test]
fn admission_rules_are_enforced() {
    let (engine, _, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    engine.admit_interface(iface("eth2", 2)).unwrap();
    assert!(engine.admit_interface(iface("eth1", 1)).is_err());
    assert_eq!(engine.list_interfaces().len(), 2);

    // Profiles referencing unknown endpoints are refused.
    let mut orphan = voice_profile();
    orphan.dst_interface = "eth9".into();
    assert!(engine.add_profile(orphan).is_err());

    engine.add_profile(voice_profile()).unwrap();
    assert!(engine.add_profile(voice_profile()).is_err());
    assert!(engine.profile("voice").is_ok());
    assert!(engine.remove_profile("nope").is_err());
}

#[test]
#[serial]
fn traffic_flows_with_expected_dscp() {
    let (engine, a_to_b, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    engine.admit_interface(iface("eth2", 2)).unwrap();
    engine.add_profile(voice_profile()).unwrap();

    assert_eq!(engine.start_traffic().unwrap(), 1);
    assert!(engine.is_running());
    // Starting again is a no-op while running.
    assert_eq!(engine.start_traffic().unwrap(), 0);

    std::thread::sleep(Duration::from_millis(400));
    engine.stop_traffic();
    assert!(!engine.is_running());

    let stats = engine.stats();
    let eth1 = &stats.interfaces["eth1"];
    assert!(eth1.tx_frames > 0, "no frames emitted");
    assert_eq!(eth1.tx_frames as usize, a_to_b.len());
    assert_eq!(eth1.tx_bytes, eth1.tx_frames * 200);
    let voice = &stats.profiles["voice"];
    assert_eq!(voice.succeeded, eth1.tx_frames);

    // Every egress frame carries the EF code point: ToS byte 0xB8.
    let frame = a_to_b.peek_first().unwrap();
    assert_eq!(frame.len(), 200);
    assert_eq!(frame[15], 0xB8);
    let (ip, _) = Ipv4Header::parse(&frame[14..]).unwrap();
    assert_eq!(ip.dscp, 46);
    assert_eq!(ip.dst.to_string(), "10.0.0.2");
}

#[test]
#[serial]
fn stop_joins_workers_within_deadline() {
    let (engine, _, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    engine.admit_interface(iface("eth2", 2)).unwrap();
    engine.add_profile(voice_profile()).unwrap();
    engine.start_traffic().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    engine.stop_traffic();
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn snapshot_restore_round_trip() {
    let (engine, _, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    engine.admit_interface(iface("eth2", 2)).unwrap();
    engine.add_profile(voice_profile()).unwrap();
    let snapshot = engine.snapshot();

    let (other, _, _) = wired_engine();
    other.restore(snapshot.clone()).unwrap();
    assert_eq!(other.snapshot(), snapshot);
    assert_eq!(other.list_profiles().len(), 1);
    assert_eq!(other.list_interfaces().len(), 2);
}

#[test]
fn impairment_preset_resolves_at_admission() {
    let (engine, _, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    engine.admit_interface(iface("eth2", 2)).unwrap();

    let mut preset = voice_profile();
    preset.impairment_preset = Some("mobile_4g".into());
    engine.add_profile(preset).unwrap();
    let stored = engine.profile("voice").unwrap();
    assert_eq!(stored.impairments.latency_ms, 50.0);
    assert_eq!(stored.impairments.loss_percent, 1.0);

    let mut unknown = voice_profile();
    unknown.name = "bad".into();
    unknown.impairment_preset = Some("warp-speed".into());
    assert!(engine.add_profile(unknown).is_err());
}

#[test]
fn impairment_toggle_is_global() {
    let (engine, _, _) = wired_engine();
    assert!(engine.impairments_enabled());
    engine.set_impairments_enabled(false);
    assert!(!engine.impairments_enabled());
    engine.set_impairments_enabled(true);
    assert!(engine.impairments_enabled());
}

#[test]
fn capabilities_report_features_and_interfaces() {
    let (engine, _, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    let caps = engine.capabilities();
    assert_eq!(caps["features"]["rfc2544"], true);
    assert_eq!(caps["features"]["snmp"], false);
    assert_eq!(caps["interfaces"][0]["name"], "eth1");
    assert_eq!(caps["interfaces"][0]["nominal_rate_mbps"], 1_000);
}

#[test]
#[serial]
fn tcp_engine_runs_over_admitted_interfaces() {
    let (engine, _, _) = wired_engine();
    engine.admit_interface(iface("eth1", 1)).unwrap();
    engine.admit_interface(iface("eth2", 2)).unwrap();

    let tcp = engine
        .start_tcp("eth1", "00:11:22:33:44:02".parse().unwrap())
        .unwrap();
    assert!(engine.tcp_engine().is_some());
    let stats = tcp.stats();
    assert_eq!(stats.capacity, 64);
    assert_eq!(stats.active, 0);

    let snapshot = engine.stats();
    assert!(snapshot.tcp.is_some());
}

#[test]
fn stats_include_pool_counters() {
    let (engine, _, _) = wired_engine();
    let stats = engine.stats();
    assert_eq!(stats.pool.capacity, 1_024);
    assert_eq!(stats.pool.free + stats.pool.outstanding, 1_024);
    assert!(!stats.running);
}
