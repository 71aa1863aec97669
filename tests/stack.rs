//! End-to-end tests over full layer stacks.

use lamina::{
    ClassId, Direction, Dns, DnsQuery, Element, Error, Ethernet, Ipv4, Packet,
    Parse, Raw, Serialize, Udp,
};
use lamina::packet::ethernet::ETH_TYPE_IP;
use lamina::packet::ipv4::IP_PROTO_UDP;

/// Independent one's-complement reference, kept deliberately naive.
fn ref_cksum(data: &[u8]) -> u16 {
    let mut total: u64 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            (u64::from(chunk[0]) << 8) | u64::from(chunk[1])
        } else {
            u64::from(chunk[0]) << 8
        };
        total += word;
    }
    while total >> 16 != 0 {
        total = (total & 0xffff) + (total >> 16);
    }
    !(total as u16)
}

fn dns_query_message() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x13, 0x37, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    buf.extend_from_slice(b"\x03www\x07example\x03com\x00");
    buf.extend_from_slice(&[0, 1, 0, 1]);
    buf
}

fn udp_datagram(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&sport.to_be_bytes());
    buf.extend_from_slice(&dport.to_be_bytes());
    buf.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);
    buf
}

fn ipv4_packet(proto: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![
        0x45, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
        0x40, proto, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x01,
        0x0a, 0x00, 0x00, 0x02,
    ];
    let total = (20 + payload.len()) as u16;
    buf[2..4].copy_from_slice(&total.to_be_bytes());
    let sum = ref_cksum(&buf);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn eth_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    buf.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    buf.extend_from_slice(&ETH_TYPE_IP.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn udp_over_ipv4_auto_fields() {
    let mut ip = Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]);
    ip.set_p(IP_PROTO_UDP);
    let mut pkt = ip + Udp::new(1234, 53) + b"ping".to_vec();
    let out = pkt.bin(true).unwrap();
    assert_eq!(out.len(), 32);

    // ulen covers the UDP header and the payload.
    assert_eq!(u16::from_be_bytes([out[24], out[25]]), 12);

    // The UDP checksum matches the reference over pseudo-header,
    // header with a zeroed checksum field, and payload.
    let mut covered = vec![10, 0, 0, 1, 10, 0, 0, 2, 0, 17, 0, 12];
    covered.extend_from_slice(&out[20..26]);
    covered.extend_from_slice(&[0, 0]);
    covered.extend_from_slice(b"ping");
    let expect = match ref_cksum(&covered) {
        0 => 0xffff,
        sum => sum,
    };
    let stored = u16::from_be_bytes([out[26], out[27]]);
    assert_eq!(stored, expect);
    assert_ne!(stored, 0);

    // The IPv4 total length and header checksum are refreshed too.
    assert_eq!(u16::from_be_bytes([out[2], out[3]]), 32);
    let mut ip_hdr = out[..20].to_vec();
    let ip_sum = u16::from_be_bytes([ip_hdr[10], ip_hdr[11]]);
    ip_hdr[10] = 0;
    ip_hdr[11] = 0;
    assert_eq!(ip_sum, ref_cksum(&ip_hdr));
}

#[test]
fn udp_port_dispatch_by_destination() {
    let wire = udp_datagram(9999, 53, &dns_query_message());
    let mut pkt = Packet::from(Udp::from_bytes(&wire).unwrap());
    let dns = pkt.layer::<Dns>().expect("dns layer");
    assert_eq!(dns.id(), 0x1337);
    let mut el = dns.queries_mut().get_mut(0).expect("one question");
    if let Element::Packet(Packet::DnsQuery(q)) = &mut *el {
        assert_eq!(q.name_s(), "www.example.com.");
    } else {
        panic!("question section does not hold a question");
    }
}

#[test]
fn unregistered_port_keeps_raw_body() {
    let dns_bytes = dns_query_message();
    let wire = udp_datagram(9999, 9999, &dns_bytes);
    let mut pkt = Packet::from(Udp::from_bytes(&wire).unwrap());
    assert!(pkt.layer::<Dns>().is_none());
    assert_eq!(pkt.body_bytes().unwrap(), dns_bytes);
    assert_eq!(pkt.bin(false).unwrap(), wire);
}

#[test]
fn payload_mutation_invalidates_checksum() {
    // Start from a packet with a known-good checksum.
    let mut ip = Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]);
    ip.set_p(IP_PROTO_UDP);
    let mut crafted = ip + Udp::new(1234, 9999) + b"ping".to_vec();
    let wire = crafted.bin(true).unwrap();
    let good_sum = u16::from_be_bytes([wire[26], wire[27]]);

    // Mutate one payload byte and serialize with auto-fields.
    let mut pkt = Packet::from(Ipv4::from_bytes(&wire).unwrap());
    pkt.layer::<Udp>().unwrap().set_body_bytes(b"pong".to_vec());
    let out = pkt.bin(true).unwrap();
    let new_sum = u16::from_be_bytes([out[26], out[27]]);
    assert_ne!(new_sum, good_sum);

    let mut covered = vec![10, 0, 0, 1, 10, 0, 0, 2, 0, 17, 0, 12];
    covered.extend_from_slice(&out[20..26]);
    covered.extend_from_slice(&[0, 0]);
    covered.extend_from_slice(b"pong");
    let expect = match ref_cksum(&covered) {
        0 => 0xffff,
        sum => sum,
    };
    assert_eq!(new_sum, expect);

    // Without auto-fields the stale user-visible checksum survives.
    let mut pkt = Packet::from(Ipv4::from_bytes(&wire).unwrap());
    pkt.layer::<Udp>().unwrap().set_body_bytes(b"pong".to_vec());
    let out = pkt.bin(false).unwrap();
    assert_eq!(u16::from_be_bytes([out[26], out[27]]), good_sum);
}

#[test]
fn checksum_covers_refreshed_dns_counts() {
    let mut ip = Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]);
    ip.set_p(IP_PROTO_UDP);
    let mut dns = Dns::default();
    dns.queries_mut().push(Element::Packet(DnsQuery::new("www.example.com").into()));
    let mut pkt = ip + Udp::new(1234, 53) + dns;
    let out = pkt.bin(true).unwrap();

    // The emitted question count is 1.
    assert_eq!(u16::from_be_bytes([out[32], out[33]]), 1);

    // The UDP checksum covers the DNS bytes as emitted.
    let udp_and_dns = &out[20..];
    let len = udp_and_dns.len() as u16;
    let mut covered = vec![10, 0, 0, 1, 10, 0, 0, 2, 0, 17];
    covered.extend_from_slice(&len.to_be_bytes());
    covered.extend_from_slice(&udp_and_dns[..6]);
    covered.extend_from_slice(&[0, 0]);
    covered.extend_from_slice(&udp_and_dns[8..]);
    let expect = match ref_cksum(&covered) {
        0 => 0xffff,
        sum => sum,
    };
    assert_eq!(u16::from_be_bytes([out[26], out[27]]), expect);
}

#[test]
fn full_stack_roundtrip() {
    let frame = eth_frame(&ipv4_packet(
        IP_PROTO_UDP,
        &udp_datagram(1234, 53, &dns_query_message()),
    ));
    let mut pkt = Packet::from(Ethernet::from_bytes(&frame).unwrap());
    assert!(pkt.dissect_error().is_none());
    assert_eq!(pkt.bin(false).unwrap(), frame);
}

#[test]
fn lazy_parse_equals_full_parse() {
    let frame = eth_frame(&ipv4_packet(
        IP_PROTO_UDP,
        &udp_datagram(1234, 53, &dns_query_message()),
    ));
    let mut lazy = Packet::from(Ethernet::from_bytes(&frame).unwrap());
    let mut eager = Packet::from(Ethernet::from_bytes(&frame).unwrap());
    eager.dissect_full();

    let lazy_top = lazy.highest_layer_mut().class_id();
    let eager_top = eager.highest_layer_mut().class_id();
    assert_eq!(lazy_top, eager_top);
    assert_eq!(lazy_top.name(), "Dns");
    assert_eq!(lazy.bin(false).unwrap(), eager.bin(false).unwrap());
}

#[test]
fn field_mutation_survives_reserialization() {
    let frame = eth_frame(&ipv4_packet(
        IP_PROTO_UDP,
        &udp_datagram(1234, 9999, b"data"),
    ));
    let mut pkt = Packet::from(Ethernet::from_bytes(&frame).unwrap());
    pkt.layer::<Ipv4>().unwrap().set_ttl(7);
    let out = pkt.bin(true).unwrap();
    let mut again = Packet::from(Ethernet::from_bytes(&out).unwrap());
    assert_eq!(again.layer::<Ipv4>().unwrap().ttl(), 7);
}

#[test]
fn unknown_ip_protocol_keeps_raw_body() {
    let wire = ipv4_packet(200, b"mystery payload");
    let mut pkt = Packet::from(Ipv4::from_bytes(&wire).unwrap());
    assert!(pkt.dissect_error().is_none());
    assert!(pkt.upper_layer_mut().is_none());
    assert_eq!(pkt.body_bytes().unwrap(), b"mystery payload");
    assert_eq!(pkt.bin(false).unwrap(), wire);
}

#[test]
fn concatenation_is_associative() {
    let left = (Ethernet::new([1; 6], [2; 6]) + Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]))
        + Udp::new(1000, 2000);
    let right = Ethernet::new([1; 6], [2; 6])
        + (Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]) + Udp::new(1000, 2000));
    let mut left = left;
    let mut right = right;
    assert_eq!(left.bin(false).unwrap(), right.bin(false).unwrap());
}

#[test]
fn direction_symmetry_across_layers() {
    let make = |flip: bool| {
        let (src, dst) = if flip {
            ([10, 0, 0, 2], [10, 0, 0, 1])
        } else {
            ([10, 0, 0, 1], [10, 0, 0, 2])
        };
        let (sport, dport) = if flip { (2000, 1000) } else { (1000, 2000) };
        let (mac_s, mac_d) = if flip { ([2u8; 6], [1u8; 6]) } else { ([1u8; 6], [2u8; 6]) };
        Ethernet::new(mac_d, mac_s) + Ipv4::new(src, dst) + Udp::new(sport, dport)
    };
    let mut p = make(false);
    let mut q = make(true);
    assert!(p.direction_all(&mut q).contains(Direction::REV));
    assert!(q.direction_all(&mut p).contains(Direction::REV));
    assert!(p.is_direction(&mut q, Direction::REV));

    // SAME is reflexive.
    let mut p2 = make(false);
    assert!(p.direction_all(&mut p2).contains(Direction::SAME));

    // Reversing every layer turns REV into SAME.
    q.reverse_all_address();
    assert!(p.direction_all(&mut q).contains(Direction::SAME));
}

#[test]
fn keyword_construction_defaults() {
    let mut ip = Packet::from(Ipv4::default());
    assert_eq!(ip.bin(false).unwrap(), vec![
        0x45, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00,
        0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ]);
    let mut raw = Packet::from(Raw::default());
    assert_eq!(raw.bin(false).unwrap(), Vec::<u8>::new());
}

#[test]
fn bad_field_width_fails_serialization() {
    let mut eth = Ethernet::new([1; 6], [2; 6]);
    eth.set_dst(&[1, 2, 3]);
    let mut pkt = Packet::from(eth);
    let err = pkt.bin(false).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::PackFailed(..))));
}

#[test]
fn navigation_walks_the_whole_stack() {
    let frame = eth_frame(&ipv4_packet(
        IP_PROTO_UDP,
        &udp_datagram(53, 9999, &dns_query_message()),
    ));
    let mut pkt = Packet::from(Ethernet::from_bytes(&frame).unwrap());

    // Source port dispatch: 53 wins even with an odd destination.
    assert!(pkt.layer::<Dns>().is_some());
    assert_eq!(pkt.layer::<Udp>().unwrap().sport(), 53);

    pkt.dissect_full();
    let classes: Vec<&str> = pkt.upper_layers().map(|l| l.class_id().name()).collect();
    assert_eq!(classes, vec!["Ipv4", "Udp", "Dns"]);

    // Walking down: the layer below a handle is resolved against the
    // outer layer that owns the stack.
    let udp_ref = pkt.upper_layers()
        .find(|l| l.class_id() == ClassId::Udp)
        .unwrap();
    assert_eq!(pkt.lower_layer(udp_ref).unwrap().class_id(), ClassId::Ipv4);
    // Nothing sits below the lowest layer.
    assert!(pkt.lower_layer(&pkt).is_none());
}

#[test]
fn serialize_matches_bin() {
    let mut ip = Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]);
    ip.set_p(IP_PROTO_UDP);
    let mut pkt = ip + Udp::new(1234, 9999) + b"ping".to_vec();
    let expect = pkt.clone().bin(true).unwrap();
    assert_eq!(pkt.to_vec().unwrap(), expect);
}

#[test]
fn debug_aids() {
    let mut pkt = Packet::from(Raw::new(b"ABC\x00".as_slice()));
    let dump = pkt.hexdump(16, false).unwrap();
    assert!(dump.starts_with("  0000:      41 42 43 00"));
    assert!(dump.ends_with("ABC."));

    let mut udp = Packet::from(Udp::new(53, 9999));
    assert_eq!(udp.summarize(),
               "Udp(sport=53, dport=9999, ulen=8, sum=0, bytes=0)");
}

#[test]
fn body_assignment_replaces_upper_layers() {
    let frame = eth_frame(&ipv4_packet(IP_PROTO_UDP, &udp_datagram(1, 2, b"x")));
    let mut pkt = Packet::from(Ethernet::from_bytes(&frame).unwrap());
    assert!(pkt.layer::<Udp>().is_some());
    pkt.layer::<Ipv4>().unwrap();
    let ip = pkt.upper_layer_mut().unwrap();
    ip.set_body_bytes(b"gone".to_vec());
    assert!(ip.upper_layer().is_none());
    assert_eq!(ip.body_bytes().unwrap(), b"gone");
}
