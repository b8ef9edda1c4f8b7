use kari_lib::codec::netflow::{
    build_ipfix_data, build_ipfix_template, build_v5_datagram, FlowRecord, V5Header,
    IPFIX_FLOW_TEMPLATE_ID, IPFIX_TEMPLATE_SET_ID, V5_HEADER_LEN, V5_MAX_RECORDS, V5_RECORD_LEN,
};
use kari_lib::netflow::{NetflowConfig, NetflowExporter, NetflowVariant};
use std::net::Ipv4Addr;
use tokio::net::UdpSocket;

fn flow(i: u16) -> FlowRecord {
    FlowRecord {
        src_addr: Ipv4Addr::new(10, 0, 0, 1),
        dst_addr: Ipv4Addr::new(10, 0, 0, 2),
        src_port: 40000 + i,
        dst_port: 443,
        protocol: 6,
        packets: 10,
        octets: 1400,
        first_ms: 1000,
        last_ms: 2000,
    }
}

fn header(count: u16, sequence: u32) -> V5Header {
    V5Header {
        count,
        sys_uptime_ms: 123_456,
        unix_secs: 1_700_000_000,
        unix_nsecs: 0,
        flow_sequence: sequence,
        engine_type: 0,
        engine_id: 0,
    }
}

#[test]
fn v5_datagram_layout() {
    let flows = [flow(0), flow(1)];
    let datagram = build_v5_datagram(&header(2, 7), &flows).unwrap();
    assert_eq!(datagram.len(), V5_HEADER_LEN + 2 * V5_RECORD_LEN);
    assert_eq!(u16::from_be_bytes([datagram[0], datagram[1]]), 5);
    assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 2);

    let (parsed, used) = V5Header::parse(&datagram).unwrap();
    assert_eq!(used, V5_HEADER_LEN);
    assert_eq!(parsed.count, 2);
    assert_eq!(parsed.flow_sequence, 7);

    // First record: source address, then ports at their fixed offsets.
    let record = &datagram[V5_HEADER_LEN..V5_HEADER_LEN + V5_RECORD_LEN];
    assert_eq!(&record[0..4], &Ipv4Addr::new(10, 0, 0, 1).octets());
    assert_eq!(u16::from_be_bytes([record[12], record[13]]), 1); // input ifindex
    assert_eq!(u16::from_be_bytes([record[14], record[15]]), 2); // output ifindex
    assert_eq!(u16::from_be_bytes([record[32], record[33]]), 40000);
    assert_eq!(u16::from_be_bytes([record[34], record[35]]), 443);
    assert_eq!(record[37], 0x18); // ACK|PSH for TCP flows
    assert_eq!(record[38], 6);
    assert_eq!(record[44], 24); // src mask
}

#[test]
fn v5_rejects_oversized_batches() {
    let flows: Vec<FlowRecord> = (0..31).map(|i| flow(i as u16)).collect();
    assert!(build_v5_datagram(&header(31, 0), &flows).is_err());
}

#[test]
fn ipfix_template_and_data_sets() {
    let template = build_ipfix_template(1_700_000_000, 0, 99);
    assert_eq!(u16::from_be_bytes([template[0], template[1]]), 10);
    assert_eq!(
        u16::from_be_bytes([template[2], template[3]]) as usize,
        template.len()
    );
    // Template set id, then the template id itself.
    assert_eq!(
        u16::from_be_bytes([template[16], template[17]]),
        IPFIX_TEMPLATE_SET_ID
    );
    assert_eq!(
        u16::from_be_bytes([template[20], template[21]]),
        IPFIX_FLOW_TEMPLATE_ID
    );

    let data = build_ipfix_data(&[flow(0)], 1_700_000_000, 1, 99);
    assert_eq!(
        u16::from_be_bytes([data[2], data[3]]) as usize,
        data.len()
    );
    assert_eq!(
        u16::from_be_bytes([data[16], data[17]]),
        IPFIX_FLOW_TEMPLATE_ID
    );
    // One record: 4+4+1+2+2+8+8+8+8 = 45 bytes after the 4-byte set header.
    assert_eq!(data.len(), 16 + 4 + 45);
}

#[tokio::test]
async fn v5_exporter_chunks_at_thirty_records() {
    let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = collector.local_addr().unwrap();
    let mut exporter = NetflowExporter::bind(NetflowConfig {
        collector: addr,
        variant: NetflowVariant::V5,
        flows_per_second: 0,
        domain_id: 0,
    })
    .await
    .unwrap();

    let flows: Vec<FlowRecord> = (0..65).map(|i| flow(i as u16)).collect();
    exporter.export(&flows).await.unwrap();
    assert_eq!(exporter.datagrams_sent, 3);
    assert_eq!(exporter.flows_sent, 65);

    let mut buf = [0u8; 2048];
    let mut counts = Vec::new();
    for _ in 0..3 {
        let n = collector.recv(&mut buf).await.unwrap();
        let (header, _) = V5Header::parse(&buf[..n]).unwrap();
        counts.push(header.count);
        assert_eq!(
            n,
            V5_HEADER_LEN + usize::from(header.count) * V5_RECORD_LEN
        );
        assert!(usize::from(header.count) <= V5_MAX_RECORDS);
    }
    assert_eq!(counts, vec![30, 30, 5]);
}

#[tokio::test]
async fn ipfix_exporter_announces_template_first() {
    let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = collector.local_addr().unwrap();
    let mut exporter = NetflowExporter::bind(NetflowConfig {
        collector: addr,
        variant: NetflowVariant::Ipfix,
        flows_per_second: 0,
        domain_id: 7,
    })
    .await
    .unwrap();

    exporter.export(&[flow(0), flow(1)]).await.unwrap();
    exporter.export(&[flow(2)]).await.unwrap();
    assert_eq!(exporter.datagrams_sent, 3); // template + two data sets

    let mut buf = [0u8; 2048];
    collector.recv(&mut buf).await.unwrap();
    assert_eq!(
        u16::from_be_bytes([buf[16], buf[17]]),
        IPFIX_TEMPLATE_SET_ID
    );
    let n = collector.recv(&mut buf).await.unwrap();
    assert_eq!(
        u16::from_be_bytes([buf[16], buf[17]]),
        IPFIX_FLOW_TEMPLATE_ID
    );
    assert!(n > 20);
}
