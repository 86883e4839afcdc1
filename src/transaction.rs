//! Outstanding-query bookkeeping: matches incoming responses back to the
//! query that produced them by 16-bit transaction id (§4.3).

use crate::id::Id;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// What an outstanding query is for, and which timeout class applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

impl TransactionKind {
    fn timeout(self, ping_timeout: Duration, search_query_timeout: Duration) -> Duration {
        match self {
            TransactionKind::Ping => ping_timeout,
            _ => search_query_timeout,
        }
    }
}

/// What the caller gets back when a transaction resolves, one way or another.
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    Responded { from: SocketAddr },
    TimedOut,
}

struct Transaction {
    destination: SocketAddr,
    target_id: Option<Id>,
    kind: TransactionKind,
    /// Opaque caller-supplied correlation id (the search that issued this
    /// query, if any) — the table doesn't interpret it, just carries it
    /// from `allocate` back out through `resolve`/`expire`.
    tag: Option<u64>,
    sent_at: Instant,
    deadline: Instant,
}

/// Tracks in-flight queries by tid. Tids are allocated from a monotonic
/// counter modulo 2^16 and freed as soon as their transaction resolves;
/// wraparound is harmless because outstanding transactions stay in the low
/// hundreds at most (§4.3).
pub struct TransactionTable {
    next_tid: u16,
    outstanding: HashMap<u16, Transaction>,
    ping_timeout: Duration,
    search_query_timeout: Duration,
}

impl TransactionTable {
    pub fn new(ping_timeout: Duration, search_query_timeout: Duration) -> Self {
        TransactionTable { next_tid: 0, outstanding: HashMap::new(), ping_timeout, search_query_timeout }
    }

    /// Reserve a tid for a query about to be sent to `destination`. Returns
    /// the 2-byte big-endian wire encoding of the tid to embed in the `t`
    /// field.
    pub fn allocate(
        &mut self,
        destination: SocketAddr,
        target_id: Option<Id>,
        kind: TransactionKind,
        tag: Option<u64>,
        now: Instant,
    ) -> [u8; 2] {
        // A tid in active use is vanishingly unlikely to collide with the
        // counter before it frees up again, but skip over it if it does.
        while self.outstanding.contains_key(&self.next_tid) {
            self.next_tid = self.next_tid.wrapping_add(1);
        }
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);

        let deadline = now + kind.timeout(self.ping_timeout, self.search_query_timeout);
        self.outstanding.insert(tid, Transaction { destination, target_id, kind, tag, sent_at: now, deadline });
        tid.to_be_bytes()
    }

    /// Resolve an incoming response's tid against the source address it
    /// arrived from. Returns `None` (drop the datagram) when the tid is
    /// unknown or the source doesn't match the original destination — the
    /// off-path spoofing check §4.3 requires.
    pub fn resolve(&mut self, tid_bytes: &[u8], from: SocketAddr) -> Option<(TransactionKind, Option<Id>, Option<u64>)> {
        let tid = parse_tid(tid_bytes)?;
        let txn = self.outstanding.get(&tid)?;
        if txn.destination != from {
            return None;
        }
        let txn = self.outstanding.remove(&tid).expect("just looked it up");
        Some((txn.kind, txn.target_id, txn.tag))
    }

    /// Transactions whose deadline has passed. Removes and returns them so
    /// the event loop can notify continuations and mark targets failed in
    /// the routing table (§4.3, §4.4).
    pub fn expire(&mut self, now: Instant) -> Vec<(SocketAddr, TransactionKind, Option<Id>, Option<u64>)> {
        let expired: Vec<u16> =
            self.outstanding.iter().filter(|(_, t)| t.deadline <= now).map(|(tid, _)| *tid).collect();
        expired
            .into_iter()
            .map(|tid| {
                let txn = self.outstanding.remove(&tid).expect("tid came from this table");
                (txn.destination, txn.kind, txn.target_id, txn.tag)
            })
            .collect()
    }

    /// Earliest deadline among all outstanding transactions, for the event
    /// loop's wake-time computation (§4.9).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().map(|t| t.deadline).min()
    }

    pub fn sent_at(&self, tid_bytes: &[u8]) -> Option<Instant> {
        let tid = parse_tid(tid_bytes)?;
        self.outstanding.get(&tid).map(|t| t.sent_at)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

fn parse_tid(bytes: &[u8]) -> Option<u16> {
    let arr: [u8; 2] = bytes.try_into().ok()?;
    Some(u16::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        "127.0.0.1:0".parse::<SocketAddr>().map(|a| SocketAddr::new(a.ip(), port)).unwrap()
    }

    #[test]
    fn response_from_matching_address_resolves_and_frees_tid() {
        let now = Instant::now();
        let mut table = TransactionTable::new(Duration::from_secs(10), Duration::from_secs(10));
        let tid = table.allocate(addr(1), None, TransactionKind::Ping, None, now);
        assert_eq!(table.len(), 1);

        let (kind, _, _) = table.resolve(&tid, addr(1)).expect("should resolve");
        assert_eq!(kind, TransactionKind::Ping);
        assert!(table.is_empty());
    }

    #[test]
    fn response_from_wrong_address_is_ignored() {
        let now = Instant::now();
        let mut table = TransactionTable::new(Duration::from_secs(10), Duration::from_secs(10));
        let tid = table.allocate(addr(1), None, TransactionKind::Ping, None, now);

        assert!(table.resolve(&tid, addr(2)).is_none());
        // The transaction is still outstanding; a later response from the
        // right address can still land.
        assert_eq!(table.len(), 1);
        assert!(table.resolve(&tid, addr(1)).is_some());
    }

    #[test]
    fn unknown_tid_is_ignored() {
        let mut table = TransactionTable::new(Duration::from_secs(10), Duration::from_secs(10));
        assert!(table.resolve(&[0, 0], addr(1)).is_none());
    }

    #[test]
    fn ping_and_search_queries_use_distinct_timeouts() {
        let now = Instant::now();
        let mut table = TransactionTable::new(Duration::from_secs(2), Duration::from_secs(20));
        table.allocate(addr(1), None, TransactionKind::Ping, None, now);
        table.allocate(addr(2), None, TransactionKind::FindNode, None, now);

        let expired = table.expire(now + Duration::from_secs(3));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, addr(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn tag_round_trips_through_resolve() {
        let now = Instant::now();
        let mut table = TransactionTable::new(Duration::from_secs(10), Duration::from_secs(10));
        let tid = table.allocate(addr(1), None, TransactionKind::FindNode, Some(42), now);
        let (_, _, tag) = table.resolve(&tid, addr(1)).expect("should resolve");
        assert_eq!(tag, Some(42));
    }

    #[test]
    fn tid_allocation_skips_still_outstanding_slots_on_wraparound() {
        let now = Instant::now();
        let mut table = TransactionTable::new(Duration::from_secs(10), Duration::from_secs(10));
        table.next_tid = u16::MAX;
        let first = table.allocate(addr(1), None, TransactionKind::Ping, None, now);
        assert_eq!(first, u16::MAX.to_be_bytes());
        let second = table.allocate(addr(2), None, TransactionKind::Ping, None, now);
        assert_eq!(second, 0u16.to_be_bytes());
    }
}
