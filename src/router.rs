//! The run loop that owns every piece of mutable DHT state.
//!
//! One thread runs [`Router::run`]; everything else talks to it through a
//! cloneable [`DhtHandle`] whose calls only enqueue actions. Each loop
//! iteration fires due timers, reads at most one datagram (with a bounded
//! wait), drains queued actions and then advances the live searches.

use crate::cache::{build_cache, parse_cache};
use crate::config::Config;
use crate::error::DhtError;
use crate::id::NodeId;
use crate::io::DhtIo;
use crate::node::Node;
use crate::routing::RoutingTable;
use crate::search::{PeerCallback, Phase, Search, SearchId, MAX_CANDIDATES};
use crate::server::TokenSecrets;
use crate::tracker::PeerStore;
use crate::transaction::TransactionRegistry;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Message and event counters, readable after the loop stops.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub queries_in: u64,
    pub responses_in: u64,
    pub errors_in: u64,
    pub dropped: u64,
    pub sent: u64,
    pub timeouts: u64,
    /// Latched when any valid message arrives; cleared at each refresh.
    pub network_up: bool,
}

pub(crate) enum Action {
    Publish {
        key: NodeId,
        port: u16,
        ticket: u64,
    },
    Search {
        key: NodeId,
        callback: PeerCallback,
        ticket: u64,
    },
    AddContact {
        host: String,
        port: u16,
    },
    Cancel {
        key: Option<NodeId>,
        ticket: Option<u64>,
    },
    Shutdown,
}

/// Thread-safe front door to a running router.
///
/// Every method only enqueues; the run-loop thread performs the work on its
/// next iteration. The channel gives the enqueue a happens-before edge with
/// the loop's receive, so callers never touch router state directly.
#[derive(Clone)]
pub struct DhtHandle {
    sender: mpsc::Sender<Action>,
    tickets: Arc<AtomicU64>,
}

impl DhtHandle {
    fn ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, action: Action) -> Result<(), DhtError> {
        self.sender.send(action).map_err(|_| DhtError::Stopped)
    }

    /// Starts announcing that this process serves `key` on `port`.
    /// Returns a ticket usable with [`DhtHandle::cancel`].
    pub fn publish(&self, key: NodeId, port: u16) -> Result<u64, DhtError> {
        let ticket = self.ticket();
        self.send(Action::Publish { key, port, ticket })?;
        Ok(ticket)
    }

    /// Starts resolving peers for `key`; discovered endpoints are fed to
    /// `callback` from the run-loop thread.
    pub fn search(&self, key: NodeId, callback: PeerCallback) -> Result<u64, DhtError> {
        let ticket = self.ticket();
        self.send(Action::Search { key, callback, ticket })?;
        Ok(ticket)
    }

    /// Queues a bootstrap contact.
    pub fn add_contact(&self, host: impl Into<String>, port: u16) -> Result<(), DhtError> {
        self.send(Action::AddContact { host: host.into(), port })
    }

    /// Cancels searches matching the given key and/or ticket, dropping
    /// their pending transactions without waiting for timeouts.
    pub fn cancel(&self, key: Option<NodeId>, ticket: Option<u64>) -> Result<(), DhtError> {
        self.send(Action::Cancel { key, ticket })
    }

    /// Asks the run loop to stop after its current iteration.
    pub fn shutdown(&self) -> Result<(), DhtError> {
        self.send(Action::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Bootstrap,
    Refresh,
    Sweep,
}

#[derive(Debug)]
struct Timer {
    kind: TimerKind,
    at: u64,
}

pub struct Router<T: DhtIo> {
    pub(crate) config: Config,
    pub(crate) io: T,
    pub(crate) table: RoutingTable,
    pub(crate) peers: PeerStore,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) searches: HashMap<SearchId, Search>,
    pub(crate) tokens: TokenSecrets,
    pub(crate) contacts: VecDeque<(String, u16)>,
    pub(crate) stats: Stats,
    timers: Vec<Timer>,
    actions: mpsc::Receiver<Action>,
    sender: mpsc::Sender<Action>,
    tickets: Arc<AtomicU64>,
    next_search: u64,
    running: bool,
}

pub(crate) fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl<T: DhtIo> Router<T> {
    /// Builds a router, warming up from a persisted cache when one parses.
    pub fn new(config: Config, io: T, cache: Option<&[u8]>) -> Self {
        let now = epoch_now();
        let snapshot = cache.and_then(|bytes| match parse_cache(bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable bootstrap cache");
                None
            }
        });

        let self_id = snapshot
            .as_ref()
            .map(|s| s.self_id)
            .unwrap_or_else(NodeId::generate);
        let mut table = RoutingTable::new(self_id, now);
        let mut contacts = VecDeque::new();
        if let Some(snapshot) = snapshot {
            for (id, addr, last_seen) in snapshot.nodes {
                let mut node = Node::new(id, addr, now);
                node.last_seen = last_seen;
                node.recompute_active(now);
                table.add_node(node, now);
            }
            contacts.extend(snapshot.contacts);
        }
        info!(id = %self_id, nodes = table.node_count(), "dht identity ready");

        let (sender, actions) = mpsc::channel();
        let mut router = Router {
            config,
            io,
            table,
            peers: PeerStore::new(),
            transactions: TransactionRegistry::new(),
            searches: HashMap::new(),
            tokens: TokenSecrets::new(),
            contacts,
            stats: Stats::default(),
            timers: Vec::new(),
            actions,
            sender,
            tickets: Arc::new(AtomicU64::new(1)),
            next_search: 1,
            running: false,
        };
        router.schedule(TimerKind::Bootstrap, now);
        router.schedule(TimerKind::Sweep, now + router.config.sweep_interval_secs);
        router
    }

    /// A cloneable handle for the embedding application.
    pub fn handle(&self) -> DhtHandle {
        DhtHandle {
            sender: self.sender.clone(),
            tickets: Arc::clone(&self.tickets),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Serializes identity, non-bad nodes and contacts for persistence.
    pub fn store_cache(&self) -> Result<Vec<u8>, DhtError> {
        build_cache(
            self.table.self_id(),
            self.table.nodes().filter(|n| !n.is_bad()),
            self.contacts.iter().cloned(),
        )
    }

    /// The blocking event loop. Returns once a shutdown action is seen.
    pub fn run(&mut self) {
        self.running = true;
        info!(id = %self.table.self_id(), "dht router running");
        while self.running {
            let now = epoch_now();
            self.fire_timers(now);
            self.read_datagram(now);
            self.drain_actions(now);
            self.advance_searches(now);
        }
        info!("dht router stopped");
    }

    pub(crate) fn schedule(&mut self, kind: TimerKind, at: u64) {
        if let Some(timer) = self.timers.iter_mut().find(|t| t.kind == kind) {
            timer.at = at;
        } else {
            self.timers.push(Timer { kind, at });
        }
    }

    fn unschedule(&mut self, kind: TimerKind) {
        self.timers.retain(|t| t.kind != kind);
    }

    pub(crate) fn fire_timers(&mut self, now: u64) {
        let due: Vec<TimerKind> = self
            .timers
            .iter()
            .filter(|t| t.at <= now)
            .map(|t| t.kind)
            .collect();
        for kind in due {
            match kind {
                TimerKind::Bootstrap => self.bootstrap_round(now),
                TimerKind::Refresh => self.refresh(now),
                TimerKind::Sweep => {
                    self.sweep_transactions(now);
                    self.schedule(TimerKind::Sweep, now + self.config.sweep_interval_secs);
                }
            }
        }
    }

    /// One bootstrap attempt: query a burst of fallback contacts and known
    /// nodes for our own neighborhood until the table is populated enough.
    fn bootstrap_round(&mut self, now: u64) {
        if self.table.node_count() >= self.config.bootstrap_target {
            info!(nodes = self.table.node_count(), "bootstrap complete");
            self.unschedule(TimerKind::Bootstrap);
            self.schedule(TimerKind::Refresh, now + self.config.refresh_interval_secs);
            return;
        }
        let target = self.table.self_id().flip_low_bit();

        let burst = self.config.bootstrap_burst.min(self.contacts.len());
        for _ in 0..burst {
            let Some((host, port)) = self.contacts.pop_front() else { break };
            match resolve_v4(&host, port) {
                Some(addr) => {
                    self.send_find_node(NodeId::ZERO, addr, target, None, false, now);
                }
                None => debug!(host, port, "bootstrap contact did not resolve"),
            }
            // Contacts rotate to the back so later rounds retry them.
            self.contacts.push_back((host, port));
        }

        let known: Vec<(NodeId, SocketAddrV4)> = self
            .table
            .closest_nodes(&target, self.config.bootstrap_burst)
            .iter()
            .map(|n| (n.id, n.addr))
            .collect();
        for (id, addr) in known {
            if !self.transactions.has_pending(&addr) {
                self.send_find_node(id, addr, target, None, false, now);
            }
        }
        self.schedule(TimerKind::Bootstrap, now + self.config.bootstrap_retry_secs);
    }

    /// Steady-state maintenance: token rotation, health recomputation,
    /// re-pinging questionable and bad nodes, refreshing stale or thin
    /// buckets and pruning dead trackers.
    fn refresh(&mut self, now: u64) {
        self.tokens.rotate();
        self.table.recompute_active(now);

        for (id, addr) in self.table.nodes_to_reping() {
            if !self.transactions.has_pending(&addr) {
                self.send_ping(id, addr, now);
            }
        }

        let refresh_targets = self
            .table
            .buckets_needing_refresh(now, self.config.bucket_stale_secs);
        for target in refresh_targets {
            let picks: Vec<(NodeId, SocketAddrV4)> = self
                .table
                .closest_nodes(&target, 2)
                .iter()
                .map(|n| (n.id, n.addr))
                .collect();
            for (id, addr) in picks {
                if !self.transactions.has_pending(&addr) {
                    self.send_find_node(id, addr, target, None, false, now);
                }
            }
        }

        self.peers.prune(now, self.config.peer_max_age_secs);
        self.stats.network_up = false;

        // A table that thinned out below the bootstrap bar gets another
        // bootstrap pass alongside regular refreshes.
        if self.table.node_count() < self.config.bootstrap_target {
            self.schedule(TimerKind::Bootstrap, now);
        }
        self.schedule(TimerKind::Refresh, now + self.config.refresh_interval_secs);
    }

    fn sweep_transactions(&mut self, now: u64) {
        let sweep = self.transactions.sweep(now);
        for tx in sweep.stalled {
            debug!(addr = %tx.addr, "transaction stalled");
            if let Some(sid) = tx.search {
                if let Some(search) = self.searches.get_mut(&sid) {
                    search.node_stalled(&tx.node_id);
                }
            }
        }
        for tx in sweep.expired {
            self.stats.timeouts += 1;
            if !tx.node_id.is_zero() {
                self.table.mark_failed(&tx.node_id, now);
            }
            if let Some(sid) = tx.search {
                if let Some(search) = self.searches.get_mut(&sid) {
                    search.node_failed(&tx.node_id);
                    search.tx_refs = search.tx_refs.saturating_sub(1);
                }
            } else if tx.retries > 0 {
                self.resend_query(tx, now);
            }
        }
    }

    pub(crate) fn read_datagram(&mut self, now: u64) {
        let mut buf = [0u8; 2048];
        match self.io.recv(&mut buf, self.config.read_timeout) {
            Ok(Some((len, from))) => match crate::message::parse(&buf[..len]) {
                Ok(msg) => self.process(msg, from, now),
                Err(e) => {
                    self.stats.dropped += 1;
                    debug!(%from, error = %e, "dropped datagram");
                }
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "datagram read failed"),
        }
    }

    pub(crate) fn drain_actions(&mut self, now: u64) {
        while let Ok(action) = self.actions.try_recv() {
            match action {
                Action::Publish { key, port, ticket } => {
                    self.start_search(key, Some(port), None, ticket)
                }
                Action::Search { key, callback, ticket } => {
                    self.start_search(key, None, Some(callback), ticket)
                }
                Action::AddContact { host, port } => {
                    if self.contacts.len() >= self.config.max_contacts {
                        self.contacts.pop_front();
                    }
                    self.contacts.push_back((host, port));
                }
                Action::Cancel { key, ticket } => self.cancel(key, ticket, now),
                Action::Shutdown => self.running = false,
            }
        }
    }

    pub(crate) fn start_search(
        &mut self,
        key: NodeId,
        publish_port: Option<u16>,
        callback: Option<PeerCallback>,
        ticket: u64,
    ) {
        let id = SearchId(self.next_search);
        self.next_search += 1;
        let mut search = Search::new(id, key, publish_port, callback, ticket);
        if self.table.node_count() > 0 {
            let seeds: Vec<Node> = self
                .table
                .closest_nodes(&key, MAX_CANDIDATES)
                .into_iter()
                .cloned()
                .collect();
            search.seed(seeds.iter());
        }
        debug!(target = %key, publish = publish_port.is_some(), "search queued");
        self.searches.insert(id, search);
    }

    fn cancel(&mut self, key: Option<NodeId>, ticket: Option<u64>, _now: u64) {
        let matching: Vec<SearchId> = self
            .searches
            .values()
            .filter(|s| key.is_none_or(|k| s.target == k))
            .filter(|s| ticket.is_none_or(|t| s.ticket == t))
            .map(|s| s.id)
            .collect();
        for sid in matching {
            self.transactions.cancel_search(sid);
            self.searches.remove(&sid);
            debug!(search = sid.0, "search canceled");
        }
    }

    /// Gives every live search a chance to issue contacts, enter its
    /// announce phase or be reaped.
    pub(crate) fn advance_searches(&mut self, now: u64) {
        let ids: Vec<SearchId> = self.searches.keys().copied().collect();
        for sid in ids {
            // Searches queued before any node was known start as soon as
            // the table has something to seed from.
            let needs_seed = self
                .searches
                .get(&sid)
                .is_some_and(|s| !s.started && self.table.node_count() > 0);
            if needs_seed {
                let target = self.searches[&sid].target;
                let seeds: Vec<Node> = self
                    .table
                    .closest_nodes(&target, MAX_CANDIDATES)
                    .into_iter()
                    .cloned()
                    .collect();
                if let Some(search) = self.searches.get_mut(&sid) {
                    search.seed(seeds.iter());
                }
            }

            loop {
                let Some(search) = self.searches.get_mut(&sid) else { break };
                let Some((node_id, addr)) = search.next_contact() else { break };
                let target = search.target;
                self.send_find_node(node_id, addr, target, Some(sid), true, now);
            }

            let Some(search) = self.searches.get_mut(&sid) else { continue };
            if search.started && search.phase == Phase::Searching && search.is_complete() {
                if search.wants_restart() {
                    debug!(search = sid.0, "lookup found nothing, re-seeding once");
                    search.restart();
                    let target = search.target;
                    let seeds: Vec<Node> = self
                        .table
                        .closest_nodes(&target, MAX_CANDIDATES)
                        .into_iter()
                        .cloned()
                        .collect();
                    if let Some(search) = self.searches.get_mut(&sid) {
                        search.seed(seeds.iter());
                    }
                    continue;
                }
                let replicas = search.start_announce();
                let target = self.searches[&sid].target;
                debug!(search = sid.0, replicas = replicas.len(), "lookup fixed point");
                for (node_id, addr) in replicas {
                    self.send_get_peers(node_id, addr, target, sid, now);
                }
            }

            if let Some(search) = self.searches.get(&sid) {
                if search.phase == Phase::Announcing && search.tx_refs == 0 {
                    debug!(search = sid.0, replied = search.replied, "search finished");
                    self.searches.remove(&sid);
                }
            }
        }
    }
}

fn resolve_v4(host: &str, port: u16) -> Option<SocketAddrV4> {
    (host, port).to_socket_addrs().ok()?.find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    })
}
