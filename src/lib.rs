//! A Mainline DHT (BEP 5) node with BEP 44 arbitrary storage: bencode codec,
//! KRPC wire protocol, Kademlia routing table, iterative search engine, and
//! the single-task event loop that drives them (§1, §2).
//!
//! Consumers construct a [`node::Node`] around a bound UDP socket, a
//! [`clock::Clock`], and a [`crypto::Verifier`], then call [`node::Node::run`]
//! with a channel to receive completed searches on. [`node::Node::search`] /
//! [`node::Node::cancel`] / [`node::Node::observe_node`] are the operations a
//! caller drives it with while it runs; [`node::Node::save`] /
//! [`node::Node::load`] persist and restore state across restarts (§6).

pub mod bencode;
pub mod clock;
pub mod consts;
pub mod crypto;
pub mod error;
pub mod id;
pub mod node;
pub mod peer_store;
pub mod put_store;
pub mod routing;
pub mod save;
pub mod search;
pub mod token;
pub mod transaction;
pub mod wire;

pub use error::DhtError;
pub use id::Id;
pub use node::{Node, NodeLimits};
pub use search::{SearchHandle, SearchKind, SearchResult};
