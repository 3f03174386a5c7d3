use super::*;
use crate::bencode;

fn self_id() -> NodeId {
    NodeId::hash(b"self")
}

#[test]
fn ping_query_round_trip() {
    let bytes = build_query(0x2A, "ping", query_args(&self_id())).unwrap();
    match parse(&bytes).unwrap() {
        Inbound::Query(q) => {
            assert_eq!(q.tag.as_ref(), &[0x2A]);
            assert_eq!(q.sender, self_id());
            assert!(matches!(q.kind, QueryKind::Ping));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn get_peers_query_carries_info_hash() {
    let hash = NodeId::hash(b"swarm");
    let mut args = query_args(&self_id());
    args.insert_str(
        "info_hash",
        Value::Bytes(Bytes::copy_from_slice(hash.as_bytes())),
    );
    let bytes = build_query(1, "get_peers", args).unwrap();
    match parse(&bytes).unwrap() {
        Inbound::Query(q) => match q.kind {
            QueryKind::GetPeers { info_hash } => assert_eq!(info_hash, hash),
            other => panic!("unexpected kind: {:?}", other),
        },
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn announce_query_validates_port() {
    let hash = NodeId::hash(b"swarm");
    let mut args = query_args(&self_id());
    args.insert_str(
        "info_hash",
        Value::Bytes(Bytes::copy_from_slice(hash.as_bytes())),
    );
    args.insert_str("token", Value::string("tok"));
    args.insert_str("port", Value::Integer(0));
    let bytes = build_query(1, "announce_peer", args).unwrap();
    assert!(parse(&bytes).is_err());
}

#[test]
fn response_round_trip_with_nodes() {
    let node = Node::new(
        NodeId::hash(b"n1"),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
        0,
    );
    let mut body = response_body(&self_id());
    add_nodes_field(&mut body, &[&node]);
    let bytes = build_response(&[7], body).unwrap();

    match parse(&bytes).unwrap() {
        Inbound::Response(r) => {
            assert_eq!(r.tag, 7);
            assert_eq!(r.sender, self_id());
            let packed = r.body.get(b"nodes").and_then(Value::as_bytes).unwrap();
            let nodes = parse_compact_nodes(packed, 0);
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, node.id);
            assert_eq!(nodes[0].addr, node.addr);
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn response_with_wide_tag_is_rejected() {
    let body = response_body(&self_id());
    let bytes = build_response(b"ab", body).unwrap();
    assert!(parse(&bytes).is_err());
}

#[test]
fn malformed_id_is_rejected() {
    let mut args = Dict::new();
    args.insert_str("id", Value::string("short"));
    let bytes = build_query(1, "ping", args).unwrap();
    assert!(parse(&bytes).is_err());
}

#[test]
fn unknown_method_is_rejected() {
    let bytes = build_query(1, "vote", query_args(&self_id())).unwrap();
    assert!(parse(&bytes).is_err());
}

#[test]
fn error_message_parses_code() {
    let mut dict = Dict::new();
    dict.insert_str("t", Value::string("\x05"));
    dict.insert_str("y", Value::string("e"));
    dict.insert_str(
        "e",
        Value::List(vec![Value::Integer(201), Value::string("generic")]),
    );
    let bytes = bencode::encode(&Value::Dict(dict)).unwrap();
    match parse(&bytes).unwrap() {
        Inbound::Error(e) => {
            assert_eq!(e.tag, 5);
            assert_eq!(e.code, 201);
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn unusable_endpoints_are_filtered() {
    assert!(!usable_addr(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 0)));
    assert!(!usable_addr(&SocketAddrV4::new(
        Ipv4Addr::new(240, 0, 0, 1),
        6881
    )));
    assert!(usable_addr(&SocketAddrV4::new(
        Ipv4Addr::new(93, 184, 216, 34),
        6881
    )));

    let mut entry = Vec::new();
    entry.extend_from_slice(NodeId::hash(b"x").as_bytes());
    entry.extend_from_slice(&[255, 0, 0, 1]); // multicast-range ip
    entry.extend_from_slice(&6881u16.to_be_bytes());
    assert!(parse_compact_nodes(&entry, 0).is_empty());
}

#[test]
fn nodes2_accepts_only_ipv4_mapped_entries() {
    let id = NodeId::hash(b"n");
    let mut mapped = Vec::new();
    mapped.extend_from_slice(id.as_bytes());
    mapped.extend_from_slice(&[0u8; 10]);
    mapped.extend_from_slice(&[0xFF, 0xFF]);
    mapped.extend_from_slice(&[10, 0, 0, 1]);
    mapped.extend_from_slice(&6881u16.to_be_bytes());

    let mut native_v6 = mapped.clone();
    native_v6[20] = 0x20; // no longer the v4-mapped prefix

    let entries = vec![
        Value::Bytes(Bytes::from(mapped)),
        Value::Bytes(Bytes::from(native_v6)),
        Value::Bytes(Bytes::from_static(b"short")),
    ];
    let nodes = parse_compact_nodes2(&entries, 0);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, id);
    assert_eq!(*nodes[0].addr.ip(), Ipv4Addr::new(10, 0, 0, 1));
}

#[test]
fn peer_values_round_trip() {
    let peers = vec![
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51413),
    ];
    let mut body = response_body(&self_id());
    add_values_field(&mut body, &peers);
    let values = body.get(b"values").and_then(Value::as_list).unwrap();
    let parsed: Vec<_> = values
        .iter()
        .filter_map(|v| v.as_bytes().and_then(|b| parse_peer(b)))
        .collect();
    assert_eq!(parsed, peers);
}
