//! rdht - a Mainline-style Kademlia DHT engine
//!
//! This library implements the BEP-5 peer-discovery protocol for an
//! embedding application that wants to publish "this process serves key K
//! on port P" and to resolve "who serves key K" without a central
//! directory.
//!
//! # Modules
//!
//! - [`bencode`] - the wire and cache object codec
//! - [`id`] - 160-bit identifiers and the XOR closeness order
//! - [`routing`] - k-bucket routing table with node health tracking
//! - [`tracker`] - bounded per-info-hash announced-peer sets
//! - [`transaction`] - RPC correlation, tags and dual timeouts
//! - [`search`] - iterative lookup and announce state machine
//! - [`router`] - the run loop owning all mutable state
//! - [`cache`] - persisted bootstrap snapshot
//! - [`io`] - the datagram transport trait and its UDP implementation
//!
//! # Example
//!
//! ```no_run
//! use rdht::{Config, NodeId, Router, UdpIo};
//!
//! let io = UdpIo::bind(6881).expect("bind");
//! let mut router = Router::new(Config::default(), io, None);
//! let handle = router.handle();
//!
//! std::thread::spawn(move || router.run());
//!
//! handle.add_contact("router.bittorrent.com", 6881).unwrap();
//! let key = NodeId::hash(b"my keyword");
//! handle
//!     .search(
//!         key,
//!         Box::new(|_key, peer| println!("found peer {peer}")),
//!     )
//!     .unwrap();
//! ```

pub mod bencode;
pub mod cache;
pub mod config;
pub mod error;
pub mod id;
pub mod io;
pub mod message;
pub mod node;
pub mod router;
pub mod routing;
pub mod search;
pub mod tracker;
pub mod transaction;

mod server;

pub use config::Config;
pub use error::DhtError;
pub use id::NodeId;
pub use io::{DhtIo, UdpIo};
pub use node::Node;
pub use router::{DhtHandle, Router, Stats};
pub use routing::RoutingTable;
pub use search::PeerCallback;
pub use tracker::PeerStore;
