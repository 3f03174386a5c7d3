//! Wire message parsing and construction.
//!
//! Every message is a bencoded dict with a transaction tag `t`, a type
//! marker `y` (`q`uery, `r`esponse or `e`rror) and a 4-byte version `v`.
//! Queries name their method under `q` and carry arguments under `a`;
//! responses carry results under `r`. Node lists travel packed, 26 bytes
//! per entry; peer lists are 6-byte compact endpoints.

use crate::bencode::{decode, encode, Dict, Value};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::node::{Node, COMPACT_NODE_LEN};
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Version tag sent in every outgoing message.
pub const VERSION: [u8; 4] = *b"RD\x00\x01";

/// Compact peer endpoint: 4-byte IPv4 + 2-byte port.
pub const COMPACT_PEER_LEN: usize = 6;

/// Extended node entry: 20-byte id, 16-byte IPv6-mapped address, 2-byte
/// port. Only IPv4-mapped addresses are accepted.
pub const COMPACT_NODE2_LEN: usize = 38;

#[derive(Debug)]
pub enum QueryKind {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: NodeId },
    AnnouncePeer { info_hash: NodeId, token: Bytes, port: u16 },
}

#[derive(Debug)]
pub struct InboundQuery {
    /// Echoed verbatim in the response; remote tags may be any length.
    pub tag: Bytes,
    pub sender: NodeId,
    pub kind: QueryKind,
}

#[derive(Debug)]
pub struct InboundResponse {
    pub tag: u8,
    pub sender: NodeId,
    pub body: Dict,
}

#[derive(Debug)]
pub struct InboundError {
    pub tag: u8,
    pub code: i64,
}

#[derive(Debug)]
pub enum Inbound {
    Query(InboundQuery),
    Response(InboundResponse),
    Error(InboundError),
}

/// Parses and validates one inbound datagram.
///
/// Anything structurally unsound fails here so the caller can drop the
/// datagram without having mutated any state.
pub fn parse(data: &[u8]) -> Result<Inbound, DhtError> {
    let value = decode(data)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| DhtError::Protocol("message is not a dict".into()))?;
    let tag = dict
        .get(b"t")
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::Protocol("missing transaction tag".into()))?;
    let kind = dict
        .get(b"y")
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::Protocol("missing message type".into()))?;

    match kind.as_ref() {
        b"q" => parse_query(dict, tag.clone()),
        b"r" => {
            let tag = single_byte_tag(tag)?;
            let body = dict
                .get(b"r")
                .and_then(Value::as_dict)
                .ok_or_else(|| DhtError::Protocol("response without body".into()))?;
            let sender = required_id(body, b"id")?;
            Ok(Inbound::Response(InboundResponse {
                tag,
                sender,
                body: body.clone(),
            }))
        }
        b"e" => {
            let tag = single_byte_tag(tag)?;
            let code = dict
                .get(b"e")
                .and_then(Value::as_list)
                .and_then(|l| l.first())
                .and_then(Value::as_integer)
                .unwrap_or(0);
            Ok(Inbound::Error(InboundError { tag, code }))
        }
        other => Err(DhtError::Protocol(format!(
            "unknown message type {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn parse_query(dict: &Dict, tag: Bytes) -> Result<Inbound, DhtError> {
    let method = dict
        .get(b"q")
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::Protocol("query without method".into()))?;
    let args = dict
        .get(b"a")
        .and_then(Value::as_dict)
        .ok_or_else(|| DhtError::Protocol("query without arguments".into()))?;
    let sender = required_id(args, b"id")?;

    let kind = match method.as_ref() {
        b"ping" => QueryKind::Ping,
        b"find_node" => QueryKind::FindNode {
            target: required_id(args, b"target")?,
        },
        b"get_peers" => QueryKind::GetPeers {
            info_hash: required_id(args, b"info_hash")?,
        },
        b"announce_peer" => {
            let token = args
                .get(b"token")
                .and_then(Value::as_bytes)
                .ok_or_else(|| DhtError::Protocol("announce without token".into()))?
                .clone();
            let port = args
                .get(b"port")
                .and_then(Value::as_integer)
                .filter(|p| (1..=u16::MAX as i64).contains(p))
                .ok_or_else(|| DhtError::Protocol("announce with bad port".into()))?;
            QueryKind::AnnouncePeer {
                info_hash: required_id(args, b"info_hash")?,
                token,
                port: port as u16,
            }
        }
        other => {
            return Err(DhtError::Protocol(format!(
                "unknown method {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };
    Ok(Inbound::Query(InboundQuery { tag, sender, kind }))
}

fn single_byte_tag(tag: &Bytes) -> Result<u8, DhtError> {
    if tag.len() != 1 {
        return Err(DhtError::Protocol("uncorrelatable transaction tag".into()));
    }
    Ok(tag[0])
}

fn required_id(dict: &Dict, key: &[u8]) -> Result<NodeId, DhtError> {
    dict.get(key)
        .and_then(Value::as_bytes)
        .ok_or_else(|| {
            DhtError::Protocol(format!("missing {}", String::from_utf8_lossy(key)))
        })
        .and_then(|b| NodeId::from_bytes(b))
}

/// Endpoint sanity shared by every node/peer list we accept: the high
/// multicast and reserved ranges and the zero port are never usable.
pub fn usable_addr(addr: &SocketAddrV4) -> bool {
    u32::from(*addr.ip()) < u32::from(Ipv4Addr::new(239, 255, 255, 255)) && addr.port() != 0
}

/// Unpacks a `nodes` byte string of 26-byte entries, dropping unusable
/// endpoints. Trailing partial entries are ignored.
pub fn parse_compact_nodes(data: &[u8], now: u64) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| Node::from_compact(chunk, now).ok())
        .filter(|n| usable_addr(&n.addr))
        .collect()
}

/// Unpacks a `nodes2` list. Each entry is 38 bytes: id, IPv6-mapped
/// address and port; entries that are not IPv4-mapped are skipped.
pub fn parse_compact_nodes2(entries: &[Value], now: u64) -> Vec<Node> {
    let mut nodes = Vec::new();
    for entry in entries {
        let Some(bytes) = entry.as_bytes() else { continue };
        if bytes.len() != COMPACT_NODE2_LEN {
            continue;
        }
        let Ok(id) = NodeId::from_bytes(&bytes[..20]) else { continue };
        // IPv4-mapped prefix: ten zero bytes then 0xFFFF.
        if bytes[20..30] != [0u8; 10] || bytes[30..32] != [0xFF, 0xFF] {
            continue;
        }
        let ip = Ipv4Addr::new(bytes[32], bytes[33], bytes[34], bytes[35]);
        let port = u16::from_be_bytes([bytes[36], bytes[37]]);
        let addr = SocketAddrV4::new(ip, port);
        if usable_addr(&addr) {
            nodes.push(Node::new(id, addr, now));
        }
    }
    nodes
}

/// Packs nodes into the 26-byte-entry `nodes` byte string.
pub fn pack_compact_nodes(nodes: &[&Node]) -> Bytes {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(&node.to_compact());
    }
    Bytes::from(out)
}

fn pack_peer(addr: &SocketAddrV4) -> [u8; COMPACT_PEER_LEN] {
    let mut out = [0u8; COMPACT_PEER_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// Unpacks one 6-byte compact peer entry.
pub fn parse_peer(data: &[u8]) -> Option<SocketAddrV4> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    let addr = SocketAddrV4::new(ip, port);
    usable_addr(&addr).then_some(addr)
}

fn envelope(tag: &[u8], kind: &str) -> Dict {
    let mut dict = Dict::new();
    dict.insert(Bytes::from_static(b"t"), Value::Bytes(Bytes::copy_from_slice(tag)));
    dict.insert_str("v", Value::Bytes(Bytes::from_static(&VERSION)));
    dict.insert_str("y", Value::string(kind));
    dict
}

fn finish(dict: Dict) -> Result<Vec<u8>, DhtError> {
    Ok(encode(&Value::Dict(dict))?)
}

/// Builds an outgoing query for `kind` with the given arguments.
pub fn build_query(tag: u8, method: &str, args: Dict) -> Result<Vec<u8>, DhtError> {
    let mut dict = envelope(&[tag], "q");
    dict.insert_str("q", Value::string(method));
    dict.insert_str("a", Value::Dict(args));
    finish(dict)
}

/// Argument dict shared by every query: our id first.
pub fn query_args(self_id: &NodeId) -> Dict {
    let mut args = Dict::new();
    args.insert_str("id", Value::Bytes(Bytes::copy_from_slice(self_id.as_bytes())));
    args
}

/// Builds a response, echoing the query's tag verbatim.
pub fn build_response(tag: &[u8], body: Dict) -> Result<Vec<u8>, DhtError> {
    let mut dict = envelope(tag, "r");
    dict.insert_str("r", Value::Dict(body));
    finish(dict)
}

/// Response body shared by every reply: our id first.
pub fn response_body(self_id: &NodeId) -> Dict {
    let mut body = Dict::new();
    body.insert_str("id", Value::Bytes(Bytes::copy_from_slice(self_id.as_bytes())));
    body
}

/// Adds the compact `nodes` field to a find_node/get_peers response body.
pub fn add_nodes_field(body: &mut Dict, nodes: &[&Node]) {
    body.insert_str("nodes", Value::Bytes(pack_compact_nodes(nodes)));
}

/// Adds the `values` peer list to a get_peers response body.
pub fn add_values_field(body: &mut Dict, peers: &[SocketAddrV4]) {
    let values = peers
        .iter()
        .map(|p| Value::Bytes(Bytes::copy_from_slice(&pack_peer(p))))
        .collect::<Vec<_>>();
    body.insert_str("values", Value::List(values));
}

#[cfg(test)]
mod tests;
