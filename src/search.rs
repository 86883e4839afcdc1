//! Iterative lookup state machine: drives `find_node`, `get_peers`, `get`
//! and the write-phase procedures (`announce`, `put_imm`, `put_mut`) to
//! convergence against a candidate set ordered by XOR distance (§4.5).
//!
//! This module owns no I/O. The event loop asks it what to send
//! ([`SearchEngine::dispatch`]), feeds back what came of it
//! ([`SearchEngine::on_response`] / [`on_timeout`]), and polls for
//! convergence ([`SearchEngine::poll_completed`]).

use crate::bencode::BValue;
use crate::consts::{ALPHA, K, SEARCH_CANDIDATE_CAP, SEARCH_QUERY_CEILING};
use crate::id::Id;
use crate::wire::Method;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: Id,
    addr: SocketAddr,
    state: CandidateState,
    token: Option<Vec<u8>>,
    first_seen_order: u64,
}

/// The fetched value a `get` query returned, carried through to the search's
/// caller and (for `put_mut`) to the pre-write callback.
#[derive(Debug, Clone)]
pub struct GetResult {
    pub v: BValue,
    pub mutable: Option<MutableGetResult>,
}

#[derive(Debug, Clone)]
pub struct MutableGetResult {
    pub k: [u8; 32],
    pub salt: Option<Vec<u8>>,
    pub seq: i64,
    pub sig: [u8; 64],
}

/// What a query response contributed, as decoded by the wire layer. The
/// search engine doesn't parse KRPC itself — the event loop does that with
/// `wire.rs` and hands over only the pieces relevant to convergence.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub nodes: Vec<(Id, SocketAddr)>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
    pub value: Option<GetResult>,
}

/// Mutable-put fields ready to sign and send, produced by a search's
/// pre-write callback once the lookup phase has seen the current stored
/// value (if any).
pub struct OwnedMutablePut {
    pub k: [u8; 32],
    pub salt: Option<Vec<u8>>,
    pub seq: i64,
    pub sig: [u8; 64],
    pub v: BValue,
}

/// A closure invoked once per `put_mut` search, after lookup convergence,
/// with the best existing value seen (if any). Returning `None` aborts the
/// write phase entirely.
pub type PrepareMutablePut = Box<dyn FnOnce(Option<GetResult>) -> Option<OwnedMutablePut> + Send>;

pub enum SearchKind {
    FindNode,
    GetPeers,
    Get { seq_gt: Option<i64> },
    Announce { port: u16, implied_port: bool },
    PutImmutable { v: BValue },
    PutMutable { prepare: PrepareMutablePut },
}

/// What the search engine wants sent next. The event loop turns this into
/// an actual KRPC datagram via `wire.rs` and registers it with the
/// transaction table.
pub struct OutboundQuery {
    pub handle: SearchHandle,
    pub to: SocketAddr,
    pub target_node_id: Id,
    pub method: Method,
    pub seq_gt: Option<i64>,
}

/// What to actually write once the lookup phase has converged: an
/// `announce_peer` or `put` to one of the K closest responded nodes, using
/// the token that node returned during lookup.
pub enum WriteQuery {
    Announce { to: SocketAddr, target_node_id: Id, token: Vec<u8>, port: u16, implied_port: bool },
    PutImmutable { to: SocketAddr, target_node_id: Id, token: Vec<u8>, v: BValue },
    PutMutable { to: SocketAddr, target_node_id: Id, token: Vec<u8>, fields: OwnedMutablePut },
}

#[derive(Debug, Clone)]
pub enum SearchResult {
    Nodes(Vec<(Id, SocketAddr)>),
    Peers(Vec<SocketAddr>),
    Value(Option<GetResult>),
    WriteCount(usize),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchHandle(u64);

impl SearchHandle {
    /// For correlating a dispatched query with the transaction that carries
    /// it — the event loop stashes this in the transaction table's opaque
    /// tag and recovers a handle from it when a response or timeout lands.
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        SearchHandle(raw)
    }
}

struct Search {
    target: Id,
    kind_tag: SearchKindTag,
    candidates: Vec<Candidate>,
    peers: Vec<SocketAddr>,
    best_value: Option<GetResult>,
    queries_issued: usize,
    cancelled: bool,
    write_phase_started: bool,
}

/// `SearchKind` carries a non-`Clone`, non-`Debug` closure for `PutMutable`,
/// so the engine keeps it separately, tagged, and takes ownership of the
/// closure exactly once when the write phase fires.
enum SearchKindTag {
    FindNode,
    GetPeers,
    Get { seq_gt: Option<i64> },
    Announce { port: u16, implied_port: bool },
    PutImmutable { v: BValue },
    PutMutable { prepare: Option<PrepareMutablePut> },
}

impl SearchKindTag {
    fn lookup_method(&self) -> Method {
        match self {
            SearchKindTag::FindNode => Method::FindNode,
            SearchKindTag::GetPeers | SearchKindTag::Announce { .. } => Method::GetPeers,
            SearchKindTag::Get { .. } | SearchKindTag::PutImmutable { .. } | SearchKindTag::PutMutable { .. } => {
                Method::Get
            }
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, SearchKindTag::Announce { .. } | SearchKindTag::PutImmutable { .. } | SearchKindTag::PutMutable { .. })
    }

    fn seq_gt(&self) -> Option<i64> {
        match self {
            SearchKindTag::Get { seq_gt } => *seq_gt,
            _ => None,
        }
    }
}

impl From<SearchKind> for SearchKindTag {
    fn from(kind: SearchKind) -> Self {
        match kind {
            SearchKind::FindNode => SearchKindTag::FindNode,
            SearchKind::GetPeers => SearchKindTag::GetPeers,
            SearchKind::Get { seq_gt } => SearchKindTag::Get { seq_gt },
            SearchKind::Announce { port, implied_port } => SearchKindTag::Announce { port, implied_port },
            SearchKind::PutImmutable { v } => SearchKindTag::PutImmutable { v },
            SearchKind::PutMutable { prepare } => SearchKindTag::PutMutable { prepare: Some(prepare) },
        }
    }
}

struct PendingWrite {
    total: usize,
    accepted: usize,
    resolved: usize,
}

pub struct SearchEngine {
    next_handle: u64,
    next_order: u64,
    searches: HashMap<u64, Search>,
    completed: Vec<(SearchHandle, SearchResult)>,
    pending_writes: HashMap<u64, PendingWrite>,
}

impl SearchEngine {
    pub fn new() -> Self {
        SearchEngine {
            next_handle: 0,
            next_order: 0,
            searches: HashMap::new(),
            completed: Vec::new(),
            pending_writes: HashMap::new(),
        }
    }

    /// Start a new search. `seed` is typically the K closest nodes the
    /// routing table already knows about (§4.5 "initial candidate set").
    pub fn start(&mut self, target: Id, kind: SearchKind, seed: Vec<(Id, SocketAddr)>) -> SearchHandle {
        let handle = SearchHandle(self.next_handle);
        self.next_handle += 1;

        let mut candidates: Vec<Candidate> = seed
            .into_iter()
            .map(|(id, addr)| {
                let order = self.next_order;
                self.next_order += 1;
                Candidate { id, addr, state: CandidateState::Unqueried, token: None, first_seen_order: order }
            })
            .collect();
        sort_and_truncate(&mut candidates, &target, SEARCH_CANDIDATE_CAP);

        self.searches.insert(
            handle.0,
            Search {
                target,
                kind_tag: kind.into(),
                candidates,
                peers: Vec::new(),
                best_value: None,
                queries_issued: 0,
                cancelled: false,
                write_phase_started: false,
            },
        );
        handle
    }

    /// Cancel a search. Idempotent: cancelling an already-terminal handle is
    /// a no-op, and the completion callback still fires exactly once (§5
    /// "Cancellation").
    pub fn cancel(&mut self, handle: SearchHandle) {
        if let Some(search) = self.searches.get_mut(&handle.0) {
            if !search.cancelled {
                search.cancelled = true;
                self.searches.remove(&handle.0);
                self.completed.push((handle, SearchResult::Cancelled));
            }
        }
    }

    /// Up to α unqueried candidates to dispatch right now, across every
    /// active search (§4.5 "Tick").
    pub fn dispatch(&mut self) -> Vec<OutboundQuery> {
        let mut out = Vec::new();
        for (&key, search) in self.searches.iter_mut() {
            if search.queries_issued >= SEARCH_QUERY_CEILING {
                continue;
            }
            let in_flight = search.candidates.iter().filter(|c| c.state == CandidateState::InFlight).count();
            let mut slots = ALPHA.saturating_sub(in_flight);
            let method = search.kind_tag.lookup_method();
            let seq_gt = search.kind_tag.seq_gt();

            let unqueried: Vec<usize> = search
                .candidates
                .iter()
                .enumerate()
                .take(K)
                .filter(|(_, c)| c.state == CandidateState::Unqueried)
                .map(|(i, _)| i)
                .collect();

            for idx in unqueried {
                if slots == 0 || search.queries_issued >= SEARCH_QUERY_CEILING {
                    break;
                }
                search.candidates[idx].state = CandidateState::InFlight;
                search.queries_issued += 1;
                slots -= 1;
                out.push(OutboundQuery {
                    handle: SearchHandle(key),
                    to: search.candidates[idx].addr,
                    target_node_id: search.candidates[idx].id,
                    method,
                    seq_gt,
                });
            }
        }
        out
    }

    /// Feed back a response from `from_id`/`from_addr` to the outstanding
    /// query on `handle`.
    pub fn on_response(&mut self, handle: SearchHandle, from_id: Id, resp: QueryResponse) {
        let Some(search) = self.searches.get_mut(&handle.0) else { return };
        if let Some(c) = search.candidates.iter_mut().find(|c| c.id == from_id) {
            c.state = CandidateState::Responded;
            c.token = resp.token;
        }

        for (id, addr) in resp.nodes {
            if search.candidates.iter().any(|c| c.id == id) {
                continue;
            }
            let order = self.next_order;
            self.next_order += 1;
            search.candidates.push(Candidate { id, addr, state: CandidateState::Unqueried, token: None, first_seen_order: order });
        }

        sort_and_truncate(&mut search.candidates, &search.target, SEARCH_CANDIDATE_CAP);

        search.peers.extend(resp.peers);

        if let Some(value) = resp.value {
            let better = match (&search.best_value, &value.mutable) {
                (None, _) => true,
                (Some(GetResult { mutable: Some(existing), .. }), Some(new)) => new.seq > existing.seq,
                (Some(GetResult { mutable: None, .. }), _) => false,
                (Some(_), None) => false,
            };
            if better {
                search.best_value = Some(value);
            }
        }
    }

    pub fn on_timeout(&mut self, handle: SearchHandle, node_id: Id) {
        if let Some(search) = self.searches.get_mut(&handle.0) {
            if let Some(c) = search.candidates.iter_mut().find(|c| c.id == node_id) {
                c.state = CandidateState::Failed;
            }
        }
    }

    /// Drive completed lookups into their write phase (if any) or final
    /// result, and drain everything that has a result ready for delivery.
    /// The caller must send any returned `WriteQuery`s and later report
    /// their outcomes via [`SearchEngine::on_write_result`].
    pub fn poll_completed(&mut self) -> (Vec<(SearchHandle, SearchResult)>, Vec<(SearchHandle, Vec<WriteQuery>)>) {
        let mut writes_to_send = Vec::new();
        let converged: Vec<u64> = self
            .searches
            .iter()
            .filter(|(_, s)| !s.write_phase_started && is_converged(s))
            .map(|(&k, _)| k)
            .collect();

        for key in converged {
            let search = self.searches.get_mut(&key).expect("key came from this map");
            if search.kind_tag.is_write() {
                search.write_phase_started = true;
                let writes = build_write_phase(search);
                if writes.is_empty() {
                    self.searches.remove(&key);
                    self.completed.push((SearchHandle(key), SearchResult::WriteCount(0)));
                } else {
                    self.pending_writes.insert(key, PendingWrite { total: writes.len(), accepted: 0, resolved: 0 });
                    writes_to_send.push((SearchHandle(key), writes));
                }
            } else {
                let search = self.searches.remove(&key).expect("still present");
                let result = lookup_result(&search);
                self.completed.push((SearchHandle(key), result));
            }
        }

        (std::mem::take(&mut self.completed), writes_to_send)
    }

    /// Report whether a single dispatched write query succeeded. Once every
    /// write from that search's write phase has resolved (success or
    /// failure), the search completes with the count of accepted writes
    /// (§4.5 "Write phase").
    pub fn on_write_result(&mut self, handle: SearchHandle, accepted: bool) {
        let Some(entry) = self.pending_writes.get_mut(&handle.0) else { return };
        entry.resolved += 1;
        if accepted {
            entry.accepted += 1;
        }
        if entry.resolved < entry.total {
            return;
        }
        let count = entry.accepted;
        self.pending_writes.remove(&handle.0);
        self.searches.remove(&handle.0);
        self.completed.push((handle, SearchResult::WriteCount(count)));
    }

    pub fn is_active(&self, handle: SearchHandle) -> bool {
        self.searches.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_and_truncate(candidates: &mut Vec<Candidate>, target: &Id, cap: usize) {
    candidates.sort_by(|a, b| {
        let da = a.id.distance(target);
        let db = b.id.distance(target);
        da.cmp(&db).then_with(|| a.id.cmp(&b.id)).then_with(|| a.first_seen_order.cmp(&b.first_seen_order))
    });
    candidates.truncate(cap);
}

/// §4.5 "Termination": among the K closest known candidates, every one is
/// responded or failed, and nothing is in flight.
fn is_converged(search: &Search) -> bool {
    if search.cancelled {
        return true;
    }
    search
        .candidates
        .iter()
        .take(K)
        .all(|c| matches!(c.state, CandidateState::Responded | CandidateState::Failed))
}

fn lookup_result(search: &Search) -> SearchResult {
    match &search.kind_tag {
        SearchKindTag::FindNode => {
            SearchResult::Nodes(search.candidates.iter().take(K).map(|c| (c.id, c.addr)).collect())
        }
        SearchKindTag::GetPeers => SearchResult::Peers(search.peers.clone()),
        SearchKindTag::Get { .. } => SearchResult::Value(search.best_value.clone()),
        SearchKindTag::Announce { .. } | SearchKindTag::PutImmutable { .. } | SearchKindTag::PutMutable { .. } => {
            unreachable!("write-phase kinds never take the plain lookup_result path")
        }
    }
}

/// After convergence, build the `announce_peer`/`put` queries to send to the
/// K closest responded nodes that returned a token (§4.5 "Write phase").
fn build_write_phase(search: &mut Search) -> Vec<WriteQuery> {
    let targets: Vec<(SocketAddr, Id, Vec<u8>)> = search
        .candidates
        .iter()
        .take(K)
        .filter(|c| c.state == CandidateState::Responded)
        .filter_map(|c| c.token.clone().map(|t| (c.addr, c.id, t)))
        .collect();

    match &mut search.kind_tag {
        SearchKindTag::Announce { port, implied_port } => targets
            .into_iter()
            .map(|(to, target_node_id, token)| WriteQuery::Announce {
                to,
                target_node_id,
                token,
                port: *port,
                implied_port: *implied_port,
            })
            .collect(),
        SearchKindTag::PutImmutable { v } => targets
            .into_iter()
            .map(|(to, target_node_id, token)| WriteQuery::PutImmutable {
                to,
                target_node_id,
                token,
                v: v.clone(),
            })
            .collect(),
        SearchKindTag::PutMutable { prepare } => {
            let Some(prepare) = prepare.take() else { return Vec::new() };
            let Some(fields) = prepare(search.best_value.clone()) else { return Vec::new() };
            targets
                .into_iter()
                .map(|(to, target_node_id, token)| {
                    let fields = OwnedMutablePut {
                        k: fields.k,
                        salt: fields.salt.clone(),
                        seq: fields.seq,
                        sig: fields.sig,
                        v: fields.v.clone(),
                    };
                    WriteQuery::PutMutable { to, target_node_id, token, fields }
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn id(byte: u8) -> Id {
        let mut bytes = [0u8; 20];
        bytes[19] = byte;
        Id(bytes)
    }

    #[test]
    fn find_node_dispatches_up_to_alpha_then_converges() {
        let mut engine = SearchEngine::new();
        let seed: Vec<(Id, SocketAddr)> = (1..=5u8).map(|i| (id(i), addr(i as u16))).collect();
        let handle = engine.start(Id::ZERO, SearchKind::FindNode, seed);

        let first_batch = engine.dispatch();
        assert_eq!(first_batch.len(), ALPHA);

        // Nothing more dispatches while those are in flight.
        assert!(engine.dispatch().is_empty());

        for q in &first_batch {
            engine.on_response(q.handle, q.target_node_id, QueryResponse::default());
        }
        let next_batch = engine.dispatch();
        assert_eq!(next_batch.len(), 2);
        for q in &next_batch {
            engine.on_response(handle, q.target_node_id, QueryResponse::default());
        }

        let (completed, writes) = engine.poll_completed();
        assert_eq!(completed.len(), 1);
        assert!(writes.is_empty());
        match &completed[0].1 {
            SearchResult::Nodes(nodes) => assert_eq!(nodes.len(), 5),
            other => panic!("expected Nodes, got {other:?}"),
        }
    }

    #[test]
    fn timed_out_candidate_does_not_block_convergence() {
        let mut engine = SearchEngine::new();
        let seed = vec![(id(1), addr(1))];
        engine.start(Id::ZERO, SearchKind::FindNode, seed);
        let batch = engine.dispatch();
        let q = &batch[0];
        engine.on_timeout(q.handle, q.target_node_id);
        let (completed, _) = engine.poll_completed();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_fires_once() {
        let mut engine = SearchEngine::new();
        let handle = engine.start(Id::ZERO, SearchKind::FindNode, vec![(id(1), addr(1))]);
        engine.cancel(handle);
        engine.cancel(handle);
        let (completed, _) = engine.poll_completed();
        assert_eq!(completed.len(), 1);
        assert!(matches!(completed[0].1, SearchResult::Cancelled));
    }

    #[test]
    fn get_peers_accumulates_peers_across_responses() {
        let mut engine = SearchEngine::new();
        let handle = engine.start(Id::ZERO, SearchKind::GetPeers, vec![(id(1), addr(1)), (id(2), addr(2))]);
        let batch = engine.dispatch();
        for q in &batch {
            let resp = QueryResponse { peers: vec![addr(9000)], token: Some(vec![1, 2]), ..Default::default() };
            engine.on_response(handle, q.target_node_id, resp);
        }
        let (completed, _) = engine.poll_completed();
        match &completed[0].1 {
            SearchResult::Peers(peers) => assert_eq!(peers.len(), 2),
            other => panic!("expected Peers, got {other:?}"),
        }
    }
}
