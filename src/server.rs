//! Inbound message dispatch and outbound query construction.
//!
//! Queries from remote nodes are answered directly; responses and errors
//! are correlated against the transaction registry and fed back into the
//! routing table and any owning search. Structurally invalid or spoofed
//! traffic is dropped without side effects beyond the statistics counters.

use crate::id::NodeId;
use crate::io::DhtIo;
use crate::message::{
    self, Inbound, InboundError, InboundQuery, InboundResponse, QueryKind,
};
use crate::node::Node;
use crate::router::Router;
use crate::routing::K;
use crate::search::SearchId;
use crate::transaction::{RpcKind, Transaction, DEFAULT_RETRIES};
use bytes::Bytes;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::net::SocketAddrV4;
use tracing::debug;

/// Bytes of the anti-spoof token handed out with get_peers responses.
pub const TOKEN_LEN: usize = 8;

/// Rotating secrets behind the announce token scheme.
///
/// A token is a truncated digest of the endpoint under the current secret.
/// Rotation keeps one previous secret valid, so a peer holding a token from
/// the last rotation window can still announce; anything older fails.
pub struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    pub fn new() -> Self {
        let mut secrets = TokenSecrets {
            current: [0u8; 16],
            previous: [0u8; 16],
        };
        rand::rng().fill(&mut secrets.current);
        rand::rng().fill(&mut secrets.previous);
        secrets
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        rand::rng().fill(&mut self.current);
    }

    fn token_for(secret: &[u8; 16], addr: &SocketAddrV4) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update(addr.ip().octets());
        hasher.update(addr.port().to_be_bytes());
        Bytes::copy_from_slice(&hasher.finalize()[..TOKEN_LEN])
    }

    pub fn generate(&self, addr: &SocketAddrV4) -> Bytes {
        Self::token_for(&self.current, addr)
    }

    pub fn validate(&self, token: &[u8], addr: &SocketAddrV4) -> bool {
        token == Self::token_for(&self.current, addr)
            || token == Self::token_for(&self.previous, addr)
    }
}

impl Default for TokenSecrets {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DhtIo> Router<T> {
    pub(crate) fn process(&mut self, msg: Inbound, from: SocketAddrV4, now: u64) {
        if !message::usable_addr(&from) {
            self.stats.dropped += 1;
            return;
        }
        match msg {
            Inbound::Query(query) => self.process_query(query, from, now),
            Inbound::Response(response) => self.process_response(response, from, now),
            Inbound::Error(error) => self.process_error(error, from, now),
        }
    }

    fn process_query(&mut self, query: InboundQuery, from: SocketAddrV4, now: u64) {
        self.stats.queries_in += 1;
        self.stats.network_up = true;
        if query.sender == *self.table.self_id() {
            self.stats.dropped += 1;
            return;
        }
        // A query is first contact often enough that the sender is worth
        // learning; add_node refreshes it when it is already known.
        if self.table.want_node(&query.sender) {
            self.table.add_node(Node::new(query.sender, from, now), now);
        }

        let self_id = *self.table.self_id();
        let mut body = message::response_body(&self_id);
        match query.kind {
            QueryKind::Ping => {}
            QueryKind::FindNode { target } => {
                let closest = self.table.closest_nodes(&target, K);
                message::add_nodes_field(&mut body, &closest);
            }
            QueryKind::GetPeers { info_hash } => {
                let token = self.tokens.generate(&from);
                body.insert_str("token", crate::bencode::Value::Bytes(token));
                let peers = self.peers.sample_peers(&info_hash, K);
                if peers.is_empty() {
                    let closest = self.table.closest_nodes(&info_hash, K);
                    message::add_nodes_field(&mut body, &closest);
                } else {
                    message::add_values_field(&mut body, &peers);
                }
            }
            QueryKind::AnnouncePeer { info_hash, token, port } => {
                if !self.tokens.validate(&token, &from) {
                    debug!(%from, "announce with stale token ignored");
                    self.stats.dropped += 1;
                    return;
                }
                self.peers
                    .add_peer(info_hash, SocketAddrV4::new(*from.ip(), port), now);
            }
        }

        match message::build_response(&query.tag, body) {
            Ok(bytes) => self.send_datagram(&bytes, from),
            Err(e) => debug!(error = %e, "response did not encode"),
        }
    }

    fn process_response(&mut self, response: InboundResponse, from: SocketAddrV4, now: u64) {
        self.stats.responses_in += 1;
        self.stats.network_up = true;

        {
            let matched = self
                .transactions
                .lookup(*from.ip(), response.tag)
                .filter(|tx| tx.addr == from);
            let Some(tx) = matched else {
                self.stats.dropped += 1;
                return;
            };
            // Responder id must match what the query expected; a mismatch
            // means someone else answered from that address and the real
            // transaction stays pending.
            if !tx.node_id.is_zero() && tx.node_id != response.sender {
                debug!(%from, "responder id mismatch");
                self.stats.dropped += 1;
                return;
            }
        }
        let Some(tx) = self.transactions.remove(*from.ip(), response.tag) else {
            return;
        };

        if self.table.want_node(&response.sender) {
            self.table.add_node(Node::new(response.sender, from, now), now);
        } else if self.table.find_node_strict(&response.sender, &from).is_some() {
            self.table.mark_good(&response.sender, now);
        }

        match tx.kind {
            RpcKind::Ping | RpcKind::AnnouncePeer => {}
            RpcKind::FindNode => {
                self.merge_learned_nodes(tx.search, &response, now);
            }
            RpcKind::GetPeers => {
                if let Some(sid) = tx.search {
                    self.accept_peers(sid, &response, from, now);
                }
            }
        }

        if let Some(sid) = tx.search {
            if let Some(search) = self.searches.get_mut(&sid) {
                search.node_replied(&tx.node_id);
                search.tx_refs = search.tx_refs.saturating_sub(1);
            }
        }
    }

    /// Folds a find_node reply's node lists into the owning search, or into
    /// the routing table when the query was a bootstrap or refresh lookup.
    fn merge_learned_nodes(
        &mut self,
        sid: Option<SearchId>,
        response: &InboundResponse,
        now: u64,
    ) {
        use crate::bencode::Value;
        let self_id = *self.table.self_id();
        let mut learned = Vec::new();
        if let Some(packed) = response.body.get(b"nodes").and_then(Value::as_bytes) {
            learned.extend(message::parse_compact_nodes(packed, now));
        }
        if let Some(entries) = response.body.get(b"nodes2").and_then(Value::as_list) {
            learned.extend(message::parse_compact_nodes2(entries, now));
        }
        learned.retain(|n| n.id != self_id);

        match sid.and_then(|sid| self.searches.get_mut(&sid)) {
            Some(search) => {
                for node in learned {
                    search.add_candidate(node.id, node.addr);
                }
            }
            None => {
                for node in learned {
                    if self.table.want_node(&node.id) {
                        self.table.add_node(node, now);
                    }
                }
            }
        }
    }

    /// Handles a get_peers reply in the announce phase: peers go to the
    /// caller's callback, and for a publish search the returned token is
    /// immediately spent on an announce_peer.
    fn accept_peers(
        &mut self,
        sid: SearchId,
        response: &InboundResponse,
        from: SocketAddrV4,
        now: u64,
    ) {
        use crate::bencode::Value;
        let peers: Vec<SocketAddrV4> = response
            .body
            .get(b"values")
            .and_then(Value::as_list)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_bytes().and_then(|b| message::parse_peer(b)))
                    .collect()
            })
            .unwrap_or_default();
        let token = response
            .body
            .get(b"token")
            .and_then(Value::as_bytes)
            .cloned();

        let Some(search) = self.searches.get_mut(&sid) else { return };
        let target = search.target;
        let publish_port = search.publish_port;
        if let Some(callback) = search.callback.as_mut() {
            for peer in &peers {
                callback(&target, *peer);
            }
        }

        if let (Some(port), Some(token)) = (publish_port, token) {
            self.send_announce_peer(response.sender, from, target, token, port, sid, now);
        }
    }

    fn process_error(&mut self, error: InboundError, from: SocketAddrV4, now: u64) {
        self.stats.errors_in += 1;
        let matched = self
            .transactions
            .lookup(*from.ip(), error.tag)
            .filter(|tx| tx.addr == from)
            .is_some();
        if !matched {
            self.stats.dropped += 1;
            return;
        }
        let Some(tx) = self.transactions.remove(*from.ip(), error.tag) else {
            return;
        };
        debug!(%from, code = error.code, "remote error reply");
        if !tx.node_id.is_zero() {
            self.table.mark_failed(&tx.node_id, now);
        }
        if let Some(sid) = tx.search {
            if let Some(search) = self.searches.get_mut(&sid) {
                search.node_failed(&tx.node_id);
                search.tx_refs = search.tx_refs.saturating_sub(1);
            }
        }
    }

    pub(crate) fn send_ping(&mut self, node_id: NodeId, addr: SocketAddrV4, now: u64) {
        self.dispatch(RpcKind::Ping, node_id, addr, None, None, None, None, false, now);
    }

    pub(crate) fn send_find_node(
        &mut self,
        node_id: NodeId,
        addr: SocketAddrV4,
        target: NodeId,
        search: Option<SearchId>,
        quick: bool,
        now: u64,
    ) {
        self.dispatch(
            RpcKind::FindNode,
            node_id,
            addr,
            Some(target),
            None,
            search,
            None,
            quick,
            now,
        );
    }

    pub(crate) fn send_get_peers(
        &mut self,
        node_id: NodeId,
        addr: SocketAddrV4,
        info_hash: NodeId,
        search: SearchId,
        now: u64,
    ) {
        self.dispatch(
            RpcKind::GetPeers,
            node_id,
            addr,
            Some(info_hash),
            None,
            Some(search),
            None,
            false,
            now,
        );
    }

    fn send_announce_peer(
        &mut self,
        node_id: NodeId,
        addr: SocketAddrV4,
        info_hash: NodeId,
        token: Bytes,
        port: u16,
        search: SearchId,
        now: u64,
    ) {
        self.dispatch(
            RpcKind::AnnouncePeer,
            node_id,
            addr,
            Some(info_hash),
            Some(token),
            Some(search),
            Some(port),
            false,
            now,
        );
    }

    /// Re-dispatches an expired maintenance query with one less retry.
    pub(crate) fn resend_query(&mut self, tx: Transaction, now: u64) {
        let retries = tx.retries - 1;
        self.dispatch_with_retries(
            tx.kind, tx.node_id, tx.addr, tx.target, tx.token, tx.search, None,
            tx.quick_deadline.is_some(), retries, now,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        kind: RpcKind,
        node_id: NodeId,
        addr: SocketAddrV4,
        target: Option<NodeId>,
        token: Option<Bytes>,
        search: Option<SearchId>,
        port: Option<u16>,
        quick: bool,
        now: u64,
    ) {
        self.dispatch_with_retries(
            kind, node_id, addr, target, token, search, port, quick, DEFAULT_RETRIES, now,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_with_retries(
        &mut self,
        kind: RpcKind,
        node_id: NodeId,
        addr: SocketAddrV4,
        target: Option<NodeId>,
        token: Option<Bytes>,
        search: Option<SearchId>,
        port: Option<u16>,
        quick: bool,
        retries: u8,
        now: u64,
    ) {
        let transaction = Transaction {
            kind,
            node_id,
            addr,
            tag: 0,
            quick_deadline: quick.then(|| now + self.config.quick_timeout_secs),
            hard_deadline: now + self.config.hard_timeout_secs,
            retries,
            stalled: false,
            search,
            target,
            token: token.clone(),
        };
        let tag = match self.transactions.register(transaction) {
            Ok(tag) => tag,
            Err(e) => {
                debug!(%addr, error = %e, "query not dispatched");
                if let Some(sid) = search {
                    if let Some(s) = self.searches.get_mut(&sid) {
                        s.node_failed(&node_id);
                    }
                }
                return;
            }
        };
        if let Some(sid) = search {
            if let Some(s) = self.searches.get_mut(&sid) {
                s.tx_refs += 1;
            }
        }

        let self_id = *self.table.self_id();
        let mut args = message::query_args(&self_id);
        {
            use crate::bencode::Value;
            match kind {
                RpcKind::Ping => {}
                RpcKind::FindNode => {
                    if let Some(target) = target {
                        args.insert_str(
                            "target",
                            Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
                        );
                    }
                }
                RpcKind::GetPeers => {
                    if let Some(target) = target {
                        args.insert_str(
                            "info_hash",
                            Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
                        );
                    }
                }
                RpcKind::AnnouncePeer => {
                    if let Some(target) = target {
                        args.insert_str(
                            "info_hash",
                            Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
                        );
                    }
                    if let Some(token) = token {
                        args.insert_str("token", Value::Bytes(token));
                    }
                    if let Some(port) = port {
                        args.insert_str("port", Value::Integer(port as i64));
                    }
                }
            }
        }
        match message::build_query(tag, kind.method(), args) {
            Ok(bytes) => self.send_datagram(&bytes, addr),
            Err(e) => {
                debug!(error = %e, "query did not encode");
                self.transactions.remove(*addr.ip(), tag);
                if let Some(sid) = search {
                    if let Some(s) = self.searches.get_mut(&sid) {
                        s.tx_refs = s.tx_refs.saturating_sub(1);
                    }
                }
            }
        }
    }

    fn send_datagram(&mut self, bytes: &[u8], to: SocketAddrV4) {
        match self.io.send(bytes, to) {
            Ok(_) => self.stats.sent += 1,
            Err(e) => debug!(%to, error = %e, "datagram send failed"),
        }
    }
}
