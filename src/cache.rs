//! Bootstrap cache: the persisted snapshot a node warms up from.
//!
//! Written at shutdown and read at startup, using the same codec as the
//! wire. A cache that fails to parse is treated as absent and a fresh
//! identity is generated.

use crate::bencode::{decode, encode, Dict, Value};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::node::Node;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Decoded cache contents.
#[derive(Debug)]
pub struct CacheSnapshot {
    pub self_id: NodeId,
    /// (id, endpoint, last-seen epoch seconds) triples.
    pub nodes: Vec<(NodeId, SocketAddrV4, u64)>,
    /// Fallback bootstrap contacts as (host, port) pairs.
    pub contacts: Vec<(String, u16)>,
}

/// Serializes the current identity, table and contact list.
pub fn build_cache(
    self_id: &NodeId,
    nodes: impl Iterator<Item = impl std::ops::Deref<Target = Node>>,
    contacts: impl Iterator<Item = (String, u16)>,
) -> Result<Vec<u8>, DhtError> {
    let mut root = Dict::new();
    root.insert_str(
        "self_id",
        Value::Bytes(Bytes::copy_from_slice(self_id.as_bytes())),
    );

    let mut node_dict = Dict::new();
    for node in nodes {
        let mut entry = Dict::new();
        entry.insert_str("i", Value::Integer(u32::from(*node.addr.ip()) as i64));
        entry.insert_str("p", Value::Integer(node.addr.port() as i64));
        entry.insert_str("t", Value::Integer(node.last_seen as i64));
        node_dict.insert(
            Bytes::copy_from_slice(node.id.as_bytes()),
            Value::Dict(entry),
        );
    }
    root.insert_str("nodes", Value::Dict(node_dict));

    let contact_list = contacts
        .map(|(host, port)| {
            Value::List(vec![Value::string(&host), Value::Integer(port as i64)])
        })
        .collect::<Vec<_>>();
    root.insert_str("contacts", Value::List(contact_list));

    Ok(encode(&Value::Dict(root))?)
}

/// Parses a persisted cache. Individually malformed node or contact
/// entries are skipped; a malformed overall structure is an error.
pub fn parse_cache(data: &[u8]) -> Result<CacheSnapshot, DhtError> {
    let value = decode(data)?;
    let root = value
        .as_dict()
        .ok_or_else(|| DhtError::Protocol("cache is not a dict".into()))?;
    let self_id = root
        .get(b"self_id")
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::Protocol("cache missing self_id".into()))
        .and_then(|b| NodeId::from_bytes(b))?;

    let mut nodes = Vec::new();
    if let Some(node_dict) = root.get(b"nodes").and_then(Value::as_dict) {
        for (key, entry) in node_dict.iter() {
            let Ok(id) = NodeId::from_bytes(key) else { continue };
            let Some(entry) = entry.as_dict() else { continue };
            let (Some(ip), Some(port), Some(seen)) = (
                entry.get(b"i").and_then(Value::as_integer),
                entry.get(b"p").and_then(Value::as_integer),
                entry.get(b"t").and_then(Value::as_integer),
            ) else {
                continue;
            };
            if !(1..=u16::MAX as i64).contains(&port) || !(0..=u32::MAX as i64).contains(&ip) {
                continue;
            }
            let addr = SocketAddrV4::new(Ipv4Addr::from(ip as u32), port as u16);
            nodes.push((id, addr, seen.max(0) as u64));
        }
    }

    let mut contacts = Vec::new();
    if let Some(list) = root.get(b"contacts").and_then(Value::as_list) {
        for entry in list {
            let Some(pair) = entry.as_list() else { continue };
            let (Some(host), Some(port)) = (
                pair.first().and_then(Value::as_str),
                pair.get(1).and_then(Value::as_integer),
            ) else {
                continue;
            };
            if (1..=u16::MAX as i64).contains(&port) {
                contacts.push((host.to_owned(), port as u16));
            }
        }
    }

    Ok(CacheSnapshot { self_id, nodes, contacts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip() {
        let self_id = NodeId::hash(b"me");
        let node = Node::new(
            NodeId::hash(b"other"),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 6881),
            1234,
        );
        let contacts = vec![("router.example.net".to_owned(), 6881u16)];
        let bytes =
            build_cache(&self_id, [&node].into_iter(), contacts.clone().into_iter()).unwrap();

        let snapshot = parse_cache(&bytes).unwrap();
        assert_eq!(snapshot.self_id, self_id);
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].0, node.id);
        assert_eq!(snapshot.nodes[0].1, node.addr);
        assert_eq!(snapshot.nodes[0].2, 1234);
        assert_eq!(snapshot.contacts, contacts);
    }

    #[test]
    fn malformed_cache_is_an_error() {
        assert!(parse_cache(b"garbage").is_err());
        assert!(parse_cache(b"d4:le").is_err());
        assert!(parse_cache(b"de").is_err());
    }

    #[test]
    fn bad_entries_are_skipped() {
        let self_id = NodeId::hash(b"me");
        let mut root = Dict::new();
        root.insert_str(
            "self_id",
            Value::Bytes(Bytes::copy_from_slice(self_id.as_bytes())),
        );
        let mut node_dict = Dict::new();
        node_dict.insert_str("short-key", Value::Dict(Dict::new()));
        root.insert_str("nodes", Value::Dict(node_dict));
        root.insert_str(
            "contacts",
            Value::List(vec![Value::List(vec![
                Value::string("host"),
                Value::Integer(0),
            ])]),
        );
        let bytes = encode(&Value::Dict(root)).unwrap();
        let snapshot = parse_cache(&bytes).unwrap();
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.contacts.is_empty());
    }
}
