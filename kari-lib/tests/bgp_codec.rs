use kari_lib::codec::bgp::{
    parse_message, push_message, Capability, MessageType, Notification, OpenMessage,
    PathAttribute, Prefix, UpdateMessage, CEASE, HEADER_LEN, MARKER, ORIGIN_IGP,
};
use std::net::Ipv4Addr;

#[test]
fn keepalive_framing() {
    let mut buf = Vec::new();
    push_message(&mut buf, MessageType::Keepalive, &[]);
    assert_eq!(buf.len(), HEADER_LEN);
    assert_eq!(&buf[..16], &MARKER);

    let (message_type, body, consumed) = parse_message(&buf).unwrap();
    assert_eq!(message_type, MessageType::Keepalive);
    assert!(body.is_empty());
    assert_eq!(consumed, HEADER_LEN);
}

#[test]
fn bad_marker_rejected() {
    let mut buf = Vec::new();
    push_message(&mut buf, MessageType::Keepalive, &[]);
    buf[0] = 0x00;
    assert!(parse_message(&buf).is_err());
}

#[test]
fn open_with_capabilities_round_trip() {
    let open = OpenMessage {
        version: 4,
        asn: 65001,
        hold_time: 180,
        router_id: Ipv4Addr::new(192, 168, 1, 1),
        capabilities: vec![
            Capability::MultiprotocolIpv4Unicast,
            Capability::RouteRefresh,
            Capability::FourByteAsn(4_200_000_000),
        ],
    };
    let body = open.encode();
    assert_eq!(OpenMessage::parse(&body).unwrap(), open);
}

#[test]
fn open_without_capabilities_round_trip() {
    let open = OpenMessage {
        version: 4,
        asn: 65010,
        hold_time: 90,
        router_id: Ipv4Addr::new(10, 0, 0, 1),
        capabilities: Vec::new(),
    };
    let body = open.encode();
    assert_eq!(body[9], 0);
    assert_eq!(OpenMessage::parse(&body).unwrap(), open);
}

#[test]
fn prefix_packing_rounds_up_to_octets() {
    let mut update = UpdateMessage::default();
    update.nlri.push(Prefix::new(Ipv4Addr::new(10, 1, 2, 0), 24));
    update.nlri.push(Prefix::new(Ipv4Addr::new(10, 1, 2, 3), 32));
    update.nlri.push(Prefix::new(Ipv4Addr::new(192, 168, 0, 0), 17));
    let body = update.encode();
    // 2 (withdrawn len) + 2 (attr len) + (1+3) + (1+4) + (1+3) NLRI bytes.
    assert_eq!(body.len(), 4 + 4 + 5 + 4);
    let parsed = UpdateMessage::parse(&body).unwrap();
    // Bits past the prefix length are not carried.
    assert_eq!(parsed.nlri[2].addr, Ipv4Addr::new(192, 168, 0, 0));
    assert_eq!(parsed.nlri[0], update.nlri[0]);
    assert_eq!(parsed.nlri[1], update.nlri[1]);
}

#[test]
fn update_attributes_round_trip() {
    let update = UpdateMessage {
        withdrawn: vec![Prefix::new(Ipv4Addr::new(10, 9, 0, 0), 16)],
        attributes: vec![
            PathAttribute::origin(ORIGIN_IGP),
            PathAttribute::as_path(&[65001], false),
            PathAttribute::next_hop(Ipv4Addr::new(192, 168, 1, 1)),
            PathAttribute::local_pref(100),
        ],
        nlri: vec![
            Prefix::new(Ipv4Addr::new(10, 0, 0, 0), 24),
            Prefix::new(Ipv4Addr::new(10, 0, 1, 0), 24),
        ],
    };
    let body = update.encode();
    let parsed = UpdateMessage::parse(&body).unwrap();
    assert_eq!(parsed, update);
    assert!(parsed.attributes.iter().all(|a| a.is_transitive()));
    assert!(!parsed.attributes[0].is_optional());
}

#[test]
fn as_path_encodings() {
    let two_byte = PathAttribute::as_path(&[65001], false);
    assert_eq!(two_byte.value, vec![2, 1, 0xFD, 0xE9]);

    let four_byte = PathAttribute::as_path(&[70000], true);
    assert_eq!(four_byte.value[..2], [2, 1]);
    assert_eq!(&four_byte.value[2..], 70000u32.to_be_bytes());

    let empty = PathAttribute::as_path(&[], false);
    assert!(empty.value.is_empty());
}

#[test]
fn extended_length_attributes_round_trip() {
    let big = PathAttribute {
        flags: 0x40,
        type_code: 2,
        value: vec![0xAB; 300],
    };
    let update = UpdateMessage {
        withdrawn: Vec::new(),
        attributes: vec![big.clone()],
        nlri: Vec::new(),
    };
    let body = update.encode();
    // Attribute section: flags with the extended bit, type, 2-byte length.
    let attrs = &body[4..];
    assert_eq!(attrs[0] & 0x10, 0x10);
    assert_eq!(u16::from_be_bytes([attrs[2], attrs[3]]), 300);
    let parsed = UpdateMessage::parse(&body).unwrap();
    assert_eq!(parsed.attributes, vec![big]);

    let small = PathAttribute {
        flags: 0x40,
        type_code: 2,
        value: vec![0xAB; 200],
    };
    let body = UpdateMessage {
        withdrawn: Vec::new(),
        attributes: vec![small.clone()],
        nlri: Vec::new(),
    }
    .encode();
    assert_eq!(body[4] & 0x10, 0);
    assert_eq!(
        UpdateMessage::parse(&body).unwrap().attributes,
        vec![small]
    );
}

#[test]
fn large_nlri_update_round_trip() {
    let mut update = UpdateMessage {
        withdrawn: Vec::new(),
        attributes: vec![
            PathAttribute::origin(ORIGIN_IGP),
            PathAttribute::as_path(&[65001], false),
            PathAttribute::next_hop(Ipv4Addr::new(10, 0, 0, 1)),
        ],
        nlri: Vec::new(),
    };
    for i in 0..1000u32 {
        update.nlri.push(Prefix::new(
            Ipv4Addr::new(10, (i / 256) as u8, (i % 256) as u8, 0),
            24,
        ));
    }
    let body = update.encode();
    let parsed = UpdateMessage::parse(&body).unwrap();
    assert_eq!(parsed.nlri.len(), 1000);
    assert_eq!(parsed, update);
}

#[test]
fn notification_cease() {
    let body = CEASE.encode();
    assert_eq!(body, vec![6, 0]);
    assert_eq!(Notification::parse(&body).unwrap(), CEASE);
}

#[test]
fn parse_rejects_partial_message() {
    let mut buf = Vec::new();
    push_message(&mut buf, MessageType::Update, &[0u8; 40]);
    assert!(parse_message(&buf[..30]).is_err());
}
