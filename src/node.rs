//! The event loop: a single cooperative `tokio` task that owns the UDP
//! socket and every other piece of state, dispatching datagrams and timers
//! (§4.9). No `tokio::spawn` happens inside this module — one task, one
//! owner, per §5.

use crate::bencode::BValue;
use crate::clock::Clock;
use crate::consts::{
    BUCKET_NODE_TIMEOUT, BUCKET_REFRESH_TIMEOUT, K, PEER_TIMEOUT, PING_TIMEOUT, PUT_TIMEOUT, SEARCH_ITERATION_TIMEOUT,
    SEARCH_QUERY_TIMEOUT, TOKEN_ROTATE_INTERVAL,
};
use crate::crypto::Verifier;
use crate::error::{DhtError, krpc_code};
use crate::id::Id;
use crate::peer_store::PeerStore;
use crate::put_store::{MutablePutRequest, PutItem, PutStore};
use crate::routing::{NodeEntry, Observation, RoutingTable};
use crate::save::{self, SaveData};
use crate::search::{
    GetResult, MutableGetResult, OutboundQuery, QueryResponse, SearchEngine, SearchHandle, SearchKind, SearchResult,
    WriteQuery,
};
use crate::token::TokenIssuer;
use crate::transaction::{TransactionKind, TransactionTable};
use crate::wire::{self, Body, Method};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const RECV_BUF_LEN: usize = 4096;

/// Timeouts this node honors, overridable so tests and configuration can
/// shrink them (§3, §10.3).
#[derive(Debug, Clone)]
pub struct NodeLimits {
    pub ping_timeout: Duration,
    pub search_query_timeout: Duration,
    pub bucket_node_timeout: Duration,
    pub bucket_refresh_timeout: Duration,
    pub peer_timeout: Duration,
    pub put_timeout: Duration,
    pub token_rotate_interval: Duration,
}

impl Default for NodeLimits {
    fn default() -> Self {
        NodeLimits {
            ping_timeout: PING_TIMEOUT,
            search_query_timeout: SEARCH_QUERY_TIMEOUT,
            bucket_node_timeout: BUCKET_NODE_TIMEOUT,
            bucket_refresh_timeout: BUCKET_REFRESH_TIMEOUT,
            peer_timeout: PEER_TIMEOUT,
            put_timeout: PUT_TIMEOUT,
            token_rotate_interval: TOKEN_ROTATE_INTERVAL,
        }
    }
}

/// The Kademlia node: routing table, transaction table, token issuer, peer
/// store, put store, and search engine, wired to a single UDP socket.
pub struct Node {
    id: Id,
    socket: UdpSocket,
    routing: RoutingTable,
    transactions: TransactionTable,
    tokens: TokenIssuer,
    peers: PeerStore,
    items: PutStore,
    searches: SearchEngine,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn Verifier>,
    rng: StdRng,
    recv_buf: Vec<u8>,
    /// Liveness-check pings in flight for a full bucket's oldest entry,
    /// keyed by an id stashed in the transaction table's tag (§4.4). Not
    /// addressed by search handle, since evictions are never part of a
    /// search.
    pending_evictions: HashMap<u64, (NodeEntry, NodeEntry)>,
    next_eviction_id: u64,
    /// Where completed searches go once [`Node::run`] starts draining them.
    /// `None` until `run` is called; a dropped receiver just means results
    /// pile up unread rather than crashing the loop.
    results: Option<mpsc::UnboundedSender<(SearchHandle, SearchResult)>>,
}

impl Node {
    pub fn new(id: Id, socket: UdpSocket, clock: Arc<dyn Clock>, verifier: Arc<dyn Verifier>) -> Self {
        Self::with_limits(id, socket, clock, verifier, NodeLimits::default())
    }

    pub fn with_limits(
        id: Id,
        socket: UdpSocket,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn Verifier>,
        limits: NodeLimits,
    ) -> Self {
        let mut rng = StdRng::from_entropy();
        let now = clock.now();
        Node {
            id,
            socket,
            routing: RoutingTable::with_timeouts(id, now, limits.bucket_node_timeout, limits.bucket_refresh_timeout),
            transactions: TransactionTable::new(limits.ping_timeout, limits.search_query_timeout),
            tokens: TokenIssuer::with_interval(now, &mut rng, limits.token_rotate_interval),
            peers: PeerStore::with_timeout(limits.peer_timeout),
            items: PutStore::with_timeout(limits.put_timeout),
            searches: SearchEngine::new(),
            clock,
            verifier,
            rng,
            recv_buf: vec![0u8; RECV_BUF_LEN],
            pending_evictions: HashMap::new(),
            next_eviction_id: 0,
            results: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Record a node seen outside of the normal query/response path, e.g.
    /// from a bootstrap node list or a loaded save file (§6 "observe_node").
    pub fn observe_node(&mut self, id: Id, addr: SocketAddr) {
        let now = self.clock.now();
        if let Observation::NeedsPing { target, candidate } = self.routing.observe(id, addr, now) {
            self.ping_for_eviction(target, candidate);
        }
    }

    /// Register a new search and kick off its first queries. Results (and
    /// cancellation) are delivered through [`Node::drain_completed`].
    pub fn search(&mut self, target: Id, kind: SearchKind) -> SearchHandle {
        let seed: Vec<(Id, SocketAddr)> = self.routing.closest(&target, K).into_iter().map(|e| (e.id, e.addr)).collect();
        let handle = self.searches.start(target, kind, seed);
        self.dispatch_searches();
        handle
    }

    pub fn cancel(&mut self, handle: SearchHandle) {
        self.searches.cancel(handle);
    }

    /// Completed (or cancelled) searches ready for delivery to their caller.
    pub fn drain_completed(&mut self) -> Vec<(SearchHandle, SearchResult)> {
        let (completed, writes) = self.searches.poll_completed();
        for (handle, queries) in writes {
            for query in queries {
                self.send_write_query(handle, query);
            }
        }
        completed
    }

    /// Snapshot current routing/peer/put state for persistence (§6
    /// `save(writer)`). The node's own id is not part of this snapshot —
    /// it's read from the save file up front, before the node is
    /// constructed, so that it survives restarts even if the rest of the
    /// file is later discarded for a version mismatch.
    fn to_save_data(&self) -> SaveData {
        let now = self.clock.now();
        let nodes: Vec<(Id, SocketAddr)> =
            self.routing.buckets().iter().flat_map(|b| b.entries.iter()).map(|e| (e.id, e.addr)).collect();
        SaveData { id: self.id, nodes, peers: self.peers.snapshot(now), items: self.items.snapshot(now) }
    }

    pub fn save(&self, writer: &mut impl std::io::Write) -> Result<(), DhtError> {
        writer.write_all(&save::encode(&self.to_save_data()))?;
        Ok(())
    }

    /// Merge a previously saved state into this node: observe each saved
    /// node through the normal bucket/eviction path, and restore peer and
    /// put records with whatever ttl they had left (§6 `load(reader)`,
    /// §10.4). A version mismatch discards the file and starts fresh,
    /// logged as a warning rather than an error.
    pub fn load(&mut self, reader: &mut impl std::io::Read) -> Result<(), DhtError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        let Some(data) = save::decode(&raw)? else {
            tracing::warn!("save file version mismatch, discarding and starting fresh");
            return Ok(());
        };

        for (id, addr) in data.nodes {
            self.observe_node(id, addr);
        }
        let now = self.clock.now();
        for (hash, peers) in data.peers {
            for (addr, ttl) in peers {
                self.peers.restore(hash, addr, ttl, now);
            }
        }
        for (key, item, ttl) in data.items {
            self.items.restore(key, item, ttl, now);
        }
        tracing::info!(id=%self.id, nodes=self.routing.len(), "loaded save file");
        Ok(())
    }

    /// Run the event loop until the socket errors out. §4.9: block in a UDP
    /// receive bounded by the earliest pending deadline; on wake, advance
    /// whatever fired.
    ///
    /// Completed searches are pushed to `results` as they land — the loop
    /// itself never returns, so this is the only way a caller started on
    /// `search`/`observe_node` before invoking `run` learns the outcome.
    pub async fn run(&mut self, results: mpsc::UnboundedSender<(SearchHandle, SearchResult)>) -> Result<(), DhtError> {
        self.results = Some(results);
        loop {
            let now = self.clock.now();
            let wake = self.next_wake(now);
            let mut buf = std::mem::take(&mut self.recv_buf);
            let timeout = wake.saturating_duration_since(now).max(Duration::from_millis(1));

            let datagram = tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, from)) => Some((buf[..n].to_vec(), from)),
                        Err(err) => {
                            self.recv_buf = buf;
                            return Err(DhtError::Io(err));
                        }
                    }
                }
                _ = tokio::time::sleep(timeout) => None,
            };
            self.recv_buf = buf;

            if let Some((bytes, from)) = datagram {
                self.on_datagram(&bytes, from);
            }

            self.on_tick();
        }
    }

    fn next_wake(&self, now: Instant) -> Instant {
        let mut wake = now + SEARCH_ITERATION_TIMEOUT;
        if let Some(t) = self.transactions.next_deadline() {
            wake = wake.min(t);
        }
        if let Some(t) = self.routing.buckets().iter().map(|b| b.refresh_at).min() {
            wake = wake.min(t);
        }
        wake.min(self.tokens.next_rotation())
    }

    fn on_tick(&mut self) {
        let now = self.clock.now();

        for (destination, kind, target_id, tag) in self.transactions.expire(now) {
            self.on_transaction_timeout(kind, target_id, tag, now);
            tracing::debug!(%destination, ?kind, "query timed out");
        }

        self.tokens.tick(now, &mut self.rng);
        self.peers.sweep(now);
        self.items.sweep(now);

        let due: Vec<Id> = self.routing.due_for_refresh(now, &mut self.rng);
        for target in due {
            tracing::debug!(%target, "bucket refresh due");
            self.search(target, SearchKind::FindNode);
        }

        self.dispatch_searches();
        self.flush_completed();
    }

    /// Drain completed searches and push them to whoever `run` is handing
    /// them to, if anyone is listening yet.
    fn flush_completed(&mut self) {
        let completed = self.drain_completed();
        if let Some(tx) = &self.results {
            for item in completed {
                let _ = tx.send(item);
            }
        }
    }

    fn on_transaction_timeout(&mut self, kind: TransactionKind, target_id: Option<Id>, tag: Option<u64>, now: Instant) {
        match kind {
            TransactionKind::Ping => {
                if let Some(eviction_id) = tag {
                    if let Some((target, candidate)) = self.pending_evictions.remove(&eviction_id) {
                        self.routing.resolve_replacement(&target, candidate, false, now);
                    }
                }
            }
            TransactionKind::AnnouncePeer | TransactionKind::Put => {
                if let Some(raw) = tag {
                    self.searches.on_write_result(SearchHandle::from_raw(raw), false);
                }
                if let Some(id) = target_id {
                    self.routing.mark_failed(&id);
                }
            }
            TransactionKind::FindNode | TransactionKind::GetPeers | TransactionKind::Get => {
                if let (Some(raw), Some(id)) = (tag, target_id) {
                    self.searches.on_timeout(SearchHandle::from_raw(raw), id);
                }
                if let Some(id) = target_id {
                    self.routing.mark_failed(&id);
                }
            }
        }
    }

    fn dispatch_searches(&mut self) {
        let now = self.clock.now();
        for query in self.searches.dispatch() {
            self.send_search_query(query, now);
        }
    }

    fn send_search_query(&mut self, query: OutboundQuery, now: Instant) {
        let kind = match query.method {
            Method::FindNode => TransactionKind::FindNode,
            Method::GetPeers => TransactionKind::GetPeers,
            Method::Get => TransactionKind::Get,
            other => unreachable!("search engine never dispatches a lookup via {other:?}"),
        };
        let args = match query.method {
            Method::FindNode => wire::find_node_args(&self.id, &query.target_node_id),
            Method::GetPeers => wire::get_peers_args(&self.id, &query.target_node_id),
            Method::Get => wire::get_args(&self.id, &query.target_node_id, query.seq_gt),
            other => unreachable!("search engine never dispatches a lookup via {other:?}"),
        };
        let tid = self.transactions.allocate(query.to, Some(query.target_node_id), kind, Some(query.handle.raw()), now);
        let datagram = wire::build_query(&tid, query.method, args);
        self.send(&datagram, query.to);
    }

    fn send_write_query(&mut self, handle: SearchHandle, query: WriteQuery) {
        let now = self.clock.now();
        let (to, target_node_id, kind, method, args) = match query {
            WriteQuery::Announce { to, target_node_id, token, port, implied_port } => {
                let args = wire::announce_peer_args(&self.id, &target_node_id, port, &token, implied_port);
                (to, target_node_id, TransactionKind::AnnouncePeer, Method::AnnouncePeer, args)
            }
            WriteQuery::PutImmutable { to, target_node_id, token, v } => {
                let args = wire::put_args(&self.id, &token, &v, None);
                (to, target_node_id, TransactionKind::Put, Method::Put, args)
            }
            WriteQuery::PutMutable { to, target_node_id, token, fields } => {
                let mutable =
                    wire::MutablePutFields { k: &fields.k, salt: fields.salt.as_deref(), seq: fields.seq, sig: &fields.sig };
                let args = wire::put_args(&self.id, &token, &fields.v, Some(&mutable));
                (to, target_node_id, TransactionKind::Put, Method::Put, args)
            }
        };
        let tid = self.transactions.allocate(to, Some(target_node_id), kind, Some(handle.raw()), now);
        let bytes = wire::build_query(&tid, method, args);
        self.send(&bytes, to);
    }

    fn ping_for_eviction(&mut self, target: NodeEntry, candidate: NodeEntry) {
        let now = self.clock.now();
        let eviction_id = self.next_eviction_id;
        self.next_eviction_id = self.next_eviction_id.wrapping_add(1);
        let target_addr = target.addr;
        let target_id = target.id;
        self.pending_evictions.insert(eviction_id, (target, candidate));
        let tid = self.transactions.allocate(target_addr, Some(target_id), TransactionKind::Ping, Some(eviction_id), now);
        let datagram = wire::build_query(&tid, Method::Ping, wire::ping_args(&self.id));
        self.send(&datagram, target_addr);
    }

    fn send(&self, datagram: &[u8], to: SocketAddr) {
        if let Err(err) = self.socket.try_send_to(datagram, to) {
            tracing::debug!(%err, %to, "send failed");
        }
    }

    fn on_datagram(&mut self, raw: &[u8], from: SocketAddr) {
        let Some(envelope) = wire::parse(raw) else {
            tracing::trace!(%from, "dropped malformed datagram");
            return;
        };
        match envelope.body {
            Body::Query { method, args } => self.on_query(envelope.tid, method, args, from),
            Body::Response(r) => self.on_response(envelope.tid, r, from),
            Body::Error { code, message } => {
                tracing::debug!(%from, code, %message, "peer returned error");
            }
        }
    }

    fn on_query(&mut self, tid: Vec<u8>, method: Method, args: BValue, from: SocketAddr) {
        let Some(sender_id) = wire::responder_id(&args) else {
            tracing::trace!(%from, "query missing valid id");
            return;
        };
        self.observe_node(sender_id, from);

        let response = match method {
            Method::Ping => Ok(wire::ping_response(&self.id)),
            Method::FindNode => self.handle_find_node(&args),
            Method::GetPeers => self.handle_get_peers(&args, from),
            Method::AnnouncePeer => self.handle_announce_peer(&args, from),
            Method::Get => self.handle_get(&args, from),
            Method::Put => self.handle_put(&args, from),
        };

        let datagram = match response {
            Ok(r) => wire::build_response(&tid, r),
            Err(err) => {
                let code = err.krpc_code().unwrap_or(krpc_code::GENERIC);
                wire::build_error(&tid, code, &err.to_string())
            }
        };
        self.send(&datagram, from);
    }

    fn handle_find_node(&self, args: &BValue) -> Result<BValue, DhtError> {
        let target = args
            .get_bytes(b"target")
            .and_then(Id::from_slice)
            .ok_or_else(|| DhtError::Protocol("find_node missing target".into()))?;
        let nodes: Vec<(Id, SocketAddr)> = self.routing.closest(&target, K).into_iter().map(|e| (e.id, e.addr)).collect();
        Ok(wire::find_node_response(&self.id, &nodes))
    }

    fn handle_get_peers(&self, args: &BValue, from: SocketAddr) -> Result<BValue, DhtError> {
        let info_hash = args
            .get_bytes(b"info_hash")
            .and_then(Id::from_slice)
            .ok_or_else(|| DhtError::Protocol("get_peers missing info_hash".into()))?;
        let now = self.clock.now();
        let token = self.tokens.issue(from);
        if self.peers.contains(&info_hash) {
            let peers = self.peers.get(&info_hash, now);
            Ok(wire::get_peers_response(&self.id, &token, Some(&peers), None))
        } else {
            let nodes: Vec<(Id, SocketAddr)> =
                self.routing.closest(&info_hash, K).into_iter().map(|e| (e.id, e.addr)).collect();
            Ok(wire::get_peers_response(&self.id, &token, None, Some(&nodes)))
        }
    }

    fn handle_announce_peer(&mut self, args: &BValue, from: SocketAddr) -> Result<BValue, DhtError> {
        let info_hash = args
            .get_bytes(b"info_hash")
            .and_then(Id::from_slice)
            .ok_or_else(|| DhtError::Protocol("announce_peer missing info_hash".into()))?;
        let token = args.get_bytes(b"token").ok_or_else(|| DhtError::Protocol("announce_peer missing token".into()))?;
        if !self.tokens.verify(from, token) {
            return Err(DhtError::Protocol("bad token".into()));
        }
        let implied_port = args.get_int(b"implied_port").unwrap_or(0) != 0;
        let port = if implied_port {
            from.port()
        } else {
            args.get_int(b"port").ok_or_else(|| DhtError::Protocol("announce_peer missing port".into()))? as u16
        };
        let addr = SocketAddr::new(from.ip(), port);
        self.peers.announce(info_hash, addr, self.clock.now());
        Ok(wire::announce_peer_response(&self.id))
    }

    fn handle_get(&self, args: &BValue, from: SocketAddr) -> Result<BValue, DhtError> {
        let target = args
            .get_bytes(b"target")
            .and_then(Id::from_slice)
            .ok_or_else(|| DhtError::Protocol("get missing target".into()))?;
        let now = self.clock.now();
        let token = self.tokens.issue(from);

        match self.items.get(&target, now) {
            Some(PutItem::Immutable(item)) => {
                let fields = wire::GetResponseFields { v: &item.v, mutable: None };
                Ok(wire::get_response(&self.id, &token, None, Some(&fields)))
            }
            Some(PutItem::Mutable(item)) => {
                let seq_gt = args.get_int(b"seq");
                if seq_gt.is_some_and(|min_seq| item.seq <= min_seq) {
                    return Ok(wire::get_response(&self.id, &token, None, None));
                }
                let mutable = wire::MutableGetFields { k: &item.k, salt: item.salt.as_deref(), seq: item.seq, sig: &item.sig };
                let fields = wire::GetResponseFields { v: &item.v, mutable: Some(mutable) };
                Ok(wire::get_response(&self.id, &token, None, Some(&fields)))
            }
            None => {
                let nodes: Vec<(Id, SocketAddr)> =
                    self.routing.closest(&target, K).into_iter().map(|e| (e.id, e.addr)).collect();
                Ok(wire::get_response(&self.id, &token, Some(&nodes), None))
            }
        }
    }

    fn handle_put(&mut self, args: &BValue, from: SocketAddr) -> Result<BValue, DhtError> {
        let token = args.get_bytes(b"token").ok_or_else(|| DhtError::Protocol("put missing token".into()))?;
        if !self.tokens.verify(from, token) {
            return Err(DhtError::Protocol("bad token".into()));
        }
        let v = args.get(b"v").cloned().ok_or_else(|| DhtError::Protocol("put missing v".into()))?;
        let now = self.clock.now();

        if let Some(k) = args.get_bytes(b"k") {
            let k: [u8; 32] = k.try_into().map_err(|_| DhtError::Protocol("k must be 32 bytes".into()))?;
            let salt = args.get_bytes(b"salt");
            let seq = args.get_int(b"seq").ok_or_else(|| DhtError::Protocol("mutable put missing seq".into()))?;
            let sig_bytes = args.get_bytes(b"sig").ok_or_else(|| DhtError::Protocol("mutable put missing sig".into()))?;
            let sig: [u8; 64] = sig_bytes.try_into().map_err(|_| DhtError::Protocol("sig must be 64 bytes".into()))?;
            let req = MutablePutRequest { k, salt, seq, sig, v };
            self.items.put_mutable(req, self.verifier.as_ref(), now)?;
        } else {
            self.items.put_immutable(v, now)?;
        }
        Ok(wire::put_response(&self.id))
    }

    fn on_response(&mut self, tid: Vec<u8>, r: BValue, from: SocketAddr) {
        let Some((kind, _target_id, tag)) = self.transactions.resolve(&tid, from) else {
            tracing::trace!(%from, "response does not match an outstanding transaction");
            return;
        };
        let Some(responder_id) = wire::responder_id(&r) else { return };
        self.observe_node(responder_id, from);

        match kind {
            TransactionKind::Ping => {
                if let Some(eviction_id) = tag {
                    if let Some((target, candidate)) = self.pending_evictions.remove(&eviction_id) {
                        self.routing.resolve_replacement(&target, candidate, true, self.clock.now());
                    }
                }
            }
            TransactionKind::AnnouncePeer | TransactionKind::Put => {
                if let Some(raw) = tag {
                    self.searches.on_write_result(SearchHandle::from_raw(raw), true);
                }
            }
            TransactionKind::FindNode | TransactionKind::GetPeers | TransactionKind::Get => {
                if let Some(raw) = tag {
                    let resp = decode_query_response(&r);
                    self.searches.on_response(SearchHandle::from_raw(raw), responder_id, resp);
                }
            }
        }

        self.dispatch_searches();
        self.flush_completed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::Signer;
    use crate::crypto::test_support::{DalekCrypto, keypair};
    use std::net::Ipv4Addr;

    async fn test_node() -> (Node, UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let verifier: Arc<dyn Verifier> = Arc::new(DalekCrypto);
        let node = Node::new(Id([1u8; 20]), socket, clock, verifier);
        (node, peer, peer_addr)
    }

    /// Feed `query` (a full KRPC query datagram) through `on_datagram` as if
    /// it arrived from `peer_addr`, and capture whatever the node sends back
    /// on its real socket.
    async fn roundtrip(node: &mut Node, peer: &UdpSocket, peer_addr: SocketAddr, query: &[u8]) -> wire::Envelope {
        node.on_datagram(query, peer_addr);
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        wire::parse(&buf[..n]).expect("node sent a well-formed envelope")
    }

    fn expect_response(envelope: wire::Envelope) -> BValue {
        match envelope.body {
            Body::Response(r) => r,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_echoes_id() {
        let (mut node, peer, peer_addr) = test_node().await;
        let query = wire::build_query(b"aa", Method::Ping, wire::ping_args(&Id([2u8; 20])));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        let r = expect_response(envelope);
        assert_eq!(r.get_bytes(b"id"), Some(node.id().0.as_slice()));
    }

    #[tokio::test]
    async fn find_node_returns_closest_known_nodes() {
        let (mut node, peer, peer_addr) = test_node().await;
        let other = Id([3u8; 20]);
        node.observe_node(other, "127.0.0.1:6881".parse().unwrap());

        let target = Id([9u8; 20]);
        let query = wire::build_query(b"bb", Method::FindNode, wire::find_node_args(&Id([2u8; 20]), &target));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        let r = expect_response(envelope);

        let nodes = wire::parse_compact_nodes(r.get_bytes(b"nodes").expect("nodes field present"));
        assert!(nodes.iter().any(|(id, _)| *id == other));
    }

    #[tokio::test]
    async fn get_peers_returns_nodes_when_no_peers_known() {
        let (mut node, peer, peer_addr) = test_node().await;
        let info_hash = Id([4u8; 20]);
        let query = wire::build_query(b"cc", Method::GetPeers, wire::get_peers_args(&Id([2u8; 20]), &info_hash));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        let r = expect_response(envelope);

        assert!(r.get_list(b"values").is_none());
        assert!(r.get_bytes(b"nodes").is_some());
        assert!(r.get_bytes(b"token").is_some());
    }

    #[tokio::test]
    async fn get_peers_returns_announced_peer() {
        let (mut node, peer, peer_addr) = test_node().await;
        let info_hash = Id([4u8; 20]);
        node.peers.announce(info_hash, "127.0.0.1:4000".parse().unwrap(), node.clock.now());

        let query = wire::build_query(b"cc", Method::GetPeers, wire::get_peers_args(&Id([2u8; 20]), &info_hash));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        let r = expect_response(envelope);

        let values = r.get_list(b"values").expect("values field present");
        let peers: Vec<SocketAddr> = values.iter().filter_map(BValue::as_bytes).filter_map(wire::parse_compact_peer).collect();
        assert_eq!(peers, vec!["127.0.0.1:4000".parse::<SocketAddr>().unwrap()]);
    }

    async fn issued_token(node: &mut Node, peer: &UdpSocket, peer_addr: SocketAddr) -> Vec<u8> {
        let query = wire::build_query(b"dd", Method::GetPeers, wire::get_peers_args(&Id([2u8; 20]), &Id([4u8; 20])));
        let envelope = roundtrip(node, peer, peer_addr, &query).await;
        expect_response(envelope).get_bytes(b"token").expect("token present").to_vec()
    }

    #[tokio::test]
    async fn announce_peer_with_explicit_port_is_stored() {
        let (mut node, peer, peer_addr) = test_node().await;
        let token = issued_token(&mut node, &peer, peer_addr).await;
        let info_hash = Id([4u8; 20]);

        let query = wire::build_query(
            b"ee",
            Method::AnnouncePeer,
            wire::announce_peer_args(&Id([2u8; 20]), &info_hash, 7000, &token, false),
        );
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        expect_response(envelope);

        let stored = node.peers.get(&info_hash, node.clock.now());
        assert_eq!(stored, vec![SocketAddr::new(peer_addr.ip(), 7000)]);
    }

    #[tokio::test]
    async fn announce_peer_with_implied_port_uses_source_port() {
        let (mut node, peer, peer_addr) = test_node().await;
        let token = issued_token(&mut node, &peer, peer_addr).await;
        let info_hash = Id([4u8; 20]);

        // The declared `port` is deliberately wrong; implied_port must win.
        let query = wire::build_query(
            b"ff",
            Method::AnnouncePeer,
            wire::announce_peer_args(&Id([2u8; 20]), &info_hash, 1, &token, true),
        );
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        expect_response(envelope);

        let stored = node.peers.get(&info_hash, node.clock.now());
        assert_eq!(stored, vec![peer_addr]);
    }

    #[tokio::test]
    async fn announce_peer_rejects_bad_token() {
        let (mut node, peer, peer_addr) = test_node().await;
        let info_hash = Id([4u8; 20]);
        let query = wire::build_query(
            b"gg",
            Method::AnnouncePeer,
            wire::announce_peer_args(&Id([2u8; 20]), &info_hash, 7000, b"not-a-real-token", false),
        );
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        match envelope.body {
            Body::Error { code, .. } => assert_eq!(code, krpc_code::PROTOCOL),
            other => panic!("expected an error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_on_unknown_target_returns_closest_nodes() {
        let (mut node, peer, peer_addr) = test_node().await;
        let target = Id([5u8; 20]);
        let query = wire::build_query(b"hh", Method::Get, wire::get_args(&Id([2u8; 20]), &target, None));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &query).await;
        let r = expect_response(envelope);
        assert!(r.get_bytes(b"nodes").is_some());
        assert!(r.get(b"v").is_none());
    }

    #[tokio::test]
    async fn put_immutable_then_get_roundtrips_value() {
        let (mut node, peer, peer_addr) = test_node().await;
        let token = issued_token(&mut node, &peer, peer_addr).await;
        let v = BValue::bytes(b"hello dht".to_vec());

        let put_query = wire::build_query(b"ii", Method::Put, wire::put_args(&Id([2u8; 20]), &token, &v, None));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &put_query).await;
        expect_response(envelope);

        let key = crate::put_store::immutable_key(&v);
        let get_query = wire::build_query(b"jj", Method::Get, wire::get_args(&Id([2u8; 20]), &key, None));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &get_query).await;
        let r = expect_response(envelope);
        assert_eq!(r.get(b"v"), Some(&v));
    }

    #[tokio::test]
    async fn put_mutable_then_get_roundtrips_signed_value() {
        let (mut node, peer, peer_addr) = test_node().await;
        let token = issued_token(&mut node, &peer, peer_addr).await;
        let (secret, pubkey) = keypair(7);
        let signer = DalekCrypto;
        let v = BValue::bytes(b"mutable value".to_vec());
        let sig = signer.sign(&secret, &wire::mutable_signature_input(1, None, &v));

        let mutable = wire::MutablePutFields { k: &pubkey, salt: None, seq: 1, sig: &sig };
        let put_query = wire::build_query(b"kk", Method::Put, wire::put_args(&Id([2u8; 20]), &token, &v, Some(&mutable)));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &put_query).await;
        expect_response(envelope);

        let key = crate::put_store::mutable_key(&pubkey, None);
        let get_query = wire::build_query(b"ll", Method::Get, wire::get_args(&Id([2u8; 20]), &key, None));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &get_query).await;
        let r = expect_response(envelope);
        assert_eq!(r.get(b"v"), Some(&v));
        assert_eq!(r.get_int(b"seq"), Some(1));
        assert_eq!(r.get_bytes(b"k"), Some(pubkey.as_slice()));
    }

    #[tokio::test]
    async fn put_mutable_rejects_bad_signature() {
        let (mut node, peer, peer_addr) = test_node().await;
        let token = issued_token(&mut node, &peer, peer_addr).await;
        let (_, pubkey) = keypair(7);
        let v = BValue::bytes(b"mutable value".to_vec());
        let bogus_sig = [0u8; 64];

        let mutable = wire::MutablePutFields { k: &pubkey, salt: None, seq: 1, sig: &bogus_sig };
        let put_query = wire::build_query(b"mm", Method::Put, wire::put_args(&Id([2u8; 20]), &token, &v, Some(&mutable)));
        let envelope = roundtrip(&mut node, &peer, peer_addr, &put_query).await;
        match envelope.body {
            Body::Error { code, .. } => assert_eq!(code, krpc_code::BAD_SIGNATURE),
            other => panic!("expected an error response, got {other:?}"),
        }
    }
}

fn decode_query_response(r: &BValue) -> QueryResponse {
    let nodes = r.get_bytes(b"nodes").map(wire::parse_compact_nodes).unwrap_or_default();
    let peers = r
        .get_list(b"values")
        .map(|list| list.iter().filter_map(BValue::as_bytes).filter_map(wire::parse_compact_peer).collect())
        .unwrap_or_default();
    let token = r.get_bytes(b"token").map(|t| t.to_vec());
    let value = r.get(b"v").map(|v| {
        let mutable = match (r.get_bytes(b"k"), r.get_int(b"seq"), r.get_bytes(b"sig")) {
            (Some(k), Some(seq), Some(sig)) => {
                let k: Option<[u8; 32]> = k.try_into().ok();
                let sig: Option<[u8; 64]> = sig.try_into().ok();
                match (k, sig) {
                    (Some(k), Some(sig)) => Some(MutableGetResult { k, salt: r.get_bytes(b"salt").map(|s| s.to_vec()), seq, sig }),
                    _ => None,
                }
            }
            _ => None,
        };
        GetResult { v: v.clone(), mutable }
    });
    QueryResponse { nodes, peers, token, value }
}
