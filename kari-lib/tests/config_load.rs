use kari_lib::config::{
    load_from_path, save_to_path, validate_profile, EngineSnapshot, ImpairmentConfig,
    InterfaceConfig, InterfaceType, Protocol, TrafficProfile,
};
use std::collections::HashMap;

fn iface(name: &str, last_octet: u8) -> InterfaceConfig {
    InterfaceConfig {
        name: name.to_string(),
        mac_address: format!("00:11:22:33:44:{last_octet:02x}").parse().unwrap(),
        interface_type: InterfaceType::CopperOptimized,
        ip_address: Some([10, 0, 0, last_octet].into()),
        subnet_mask: Some([255, 255, 255, 0].into()),
        ipv6_address: None,
        gateway: Some([10, 0, 0, 254].into()),
        vlan_id: None,
        pci_address: None,
        numa_node: 0,
        speed_mbps: Some(1_000),
    }
}

fn profile(name: &str) -> TrafficProfile {
    TrafficProfile {
        name: name.to_string(),
        src_interface: "eth1".to_string(),
        dst_interface: "eth2".to_string(),
        dst_ip: "10.0.0.2".parse().unwrap(),
        src_ip: None,
        bandwidth_mbps: 100.0,
        packet_size: 1_400,
        protocol: Protocol::Ipv4,
        dscp: 46,
        vlan_outer: Some(100),
        vlan_inner: None,
        vni: None,
        mpls_label: None,
        enabled: true,
        impairment_preset: None,
        impairments: ImpairmentConfig {
            latency_ms: 50.0,
            jitter_ms: 10.0,
            loss_percent: 2.0,
            ..ImpairmentConfig::default()
        },
        use_hardware_timestamps: true,
        batch_size: 64,
        zero_copy: true,
    }
}

fn admitted() -> HashMap<String, InterfaceConfig> {
    let mut map = HashMap::new();
    map.insert("eth1".to_string(), iface("eth1", 1));
    map.insert("eth2".to_string(), iface("eth2", 2));
    map
}

#[test]
fn snapshot_round_trips_through_json_file() {
    let mut snapshot = EngineSnapshot::default();
    snapshot.interfaces.insert("eth1".into(), iface("eth1", 1));
    snapshot.interfaces.insert("eth2".into(), iface("eth2", 2));
    snapshot.traffic_profiles.insert("p1".into(), profile("p1"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kari.json");
    save_to_path(&path, &snapshot).unwrap();
    let loaded = load_from_path(&path).unwrap();
    assert_eq!(loaded, snapshot);
}

#[test]
fn unknown_keys_are_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(
        &path,
        r#"{"interfaces": {}, "traffic_profiles": {}, "bogus": 1}"#,
    )
    .unwrap();
    assert!(load_from_path(&path).is_err());

    let nested = dir.path().join("nested.json");
    std::fs::write(
        &nested,
        r#"{"interfaces": {"eth1": {"name": "eth1", "mac_address": "00:11:22:33:44:01",
            "interface_type": "copper_optimized", "frobnicate": true}}}"#,
    )
    .unwrap();
    assert!(load_from_path(&nested).is_err());
}

#[test]
fn missing_file_is_a_configuration_error() {
    let err = load_from_path("/nonexistent/kari.json").unwrap_err();
    assert!(matches!(err, kari_lib::EngineError::Config(_)));
}

#[test]
fn minimal_config_applies_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minimal.json");
    std::fs::write(
        &path,
        r#"{
            "interfaces": {
                "eth1": {"name": "eth1", "mac_address": "00:11:22:33:44:01",
                         "interface_type": "sfp_10g_dpdk"}
            },
            "traffic_profiles": {
                "p1": {"name": "p1", "src_interface": "eth1", "dst_interface": "eth1",
                       "dst_ip": "10.0.0.2", "bandwidth_mbps": 500, "packet_size": 512,
                       "protocol": "udp"}
            }
        }"#,
    )
    .unwrap();
    let snapshot = load_from_path(&path).unwrap();
    let cfg = &snapshot.interfaces["eth1"];
    assert_eq!(cfg.interface_type, InterfaceType::Sfp10gDpdk);
    assert_eq!(cfg.nominal_rate_mbps(), 10_000);
    let p = &snapshot.traffic_profiles["p1"];
    assert!(p.enabled);
    assert_eq!(p.dscp, 0);
    assert_eq!(p.batch_size, 128);
    assert!(p.impairments.is_passthrough());
    assert_eq!(p.impairments.burst_loss_length, 3);
    assert_eq!(p.impairments.reorder_gap, 3);
}

#[test]
fn validator_rejects_out_of_range_fields() {
    let interfaces = admitted();

    let mut bad_dscp = profile("p");
    bad_dscp.dscp = 64;
    assert!(validate_profile(&bad_dscp, &interfaces).is_err());

    let mut unknown_iface = profile("p");
    unknown_iface.src_interface = "eth9".into();
    assert!(validate_profile(&unknown_iface, &interfaces).is_err());

    let mut tiny = profile("p");
    tiny.protocol = Protocol::Vxlan;
    tiny.packet_size = 80;
    assert!(validate_profile(&tiny, &interfaces).is_err());

    let mut huge = profile("p");
    huge.packet_size = 4_096;
    assert!(validate_profile(&huge, &interfaces).is_err());

    let mut zero_rate = profile("p");
    zero_rate.bandwidth_mbps = 0.0;
    assert!(validate_profile(&zero_rate, &interfaces).is_err());

    let mut wide_vni = profile("p");
    wide_vni.vni = Some(1 << 24);
    assert!(validate_profile(&wide_vni, &interfaces).is_err());
}

#[test]
fn over_rate_profile_warns_but_is_admitted() {
    let interfaces = admitted();
    let mut hot = profile("p");
    hot.bandwidth_mbps = 5_000.0; // above the 1 Gb/s nominal rate
    assert!(validate_profile(&hot, &interfaces).is_ok());
}

#[test]
fn impairment_presets_resolve() {
    let lan = ImpairmentConfig::preset("lan").unwrap();
    assert_eq!(lan.latency_ms, 1.0);
    let congested = ImpairmentConfig::preset("congested").unwrap();
    assert_eq!(congested.loss_percent, 10.0);
    assert!(congested.burst_loss_percent > 0.0);
    assert!(ImpairmentConfig::preset("perfect-storm").is_none());
}
