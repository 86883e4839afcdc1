//! The Kademlia routing table: a list of buckets tiling the 160-bit id
//! space, each holding up to [`K`](crate::consts::K) live nodes (§4.4).
//!
//! The table is a pure data structure — it never performs I/O. Liveness
//! checks ("ping the oldest entry") are surfaced as an [`Observation`] the
//! caller (the node's event loop) must act on and then report back via
//! [`RoutingTable::resolve_replacement`].

use crate::consts::{BUCKET_NODE_TIMEOUT, BUCKET_REFRESH_TIMEOUT, K};
use crate::id::{Distance, Id};
use rand::RngCore;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: Id,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub pinged: bool,
    /// Set when a liveness check against this entry has failed since it
    /// was last seen; cleared on any fresh observation.
    pub bad: bool,
}

impl NodeEntry {
    fn new(id: Id, addr: SocketAddr, now: Instant) -> Self {
        NodeEntry { id, addr, last_seen: now, pinged: false, bad: false }
    }
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub first: Id,
    pub entries: Vec<NodeEntry>,
    pub refresh_at: Instant,
}

/// What happened when a node was observed. `NeedsPing` is the only variant
/// requiring caller action: send a ping to `target.addr` and report the
/// outcome via [`RoutingTable::resolve_replacement`].
#[derive(Debug, Clone)]
pub enum Observation {
    Updated,
    Inserted,
    NeedsPing { target: NodeEntry, candidate: NodeEntry },
}

pub struct RoutingTable {
    own_id: Id,
    buckets: Vec<Bucket>,
    node_timeout: Duration,
    refresh_timeout: Duration,
}

impl RoutingTable {
    pub fn new(own_id: Id, now: Instant) -> Self {
        Self::with_timeouts(own_id, now, BUCKET_NODE_TIMEOUT, BUCKET_REFRESH_TIMEOUT)
    }

    pub fn with_timeouts(own_id: Id, now: Instant, node_timeout: Duration, refresh_timeout: Duration) -> Self {
        RoutingTable {
            own_id,
            buckets: vec![Bucket { first: Id::ZERO, entries: Vec::new(), refresh_at: now + refresh_timeout }],
            node_timeout,
            refresh_timeout,
        }
    }

    pub fn own_id(&self) -> Id {
        self.own_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_index_for(&self, id: &Id) -> usize {
        // Last bucket whose `first <= id`.
        match self.buckets.binary_search_by(|b| b.first.cmp(id)) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        }
    }

    fn upper_bound(&self, idx: usize) -> Option<Id> {
        self.buckets.get(idx + 1).map(|b| b.first)
    }

    fn bucket_contains(&self, idx: usize, id: &Id) -> bool {
        let first = self.buckets[idx].first;
        if id.0 < first.0 {
            return false;
        }
        match self.upper_bound(idx) {
            Some(upper) => id.0 < upper.0,
            None => true,
        }
    }

    fn touch_refresh(&mut self, idx: usize, now: Instant) {
        self.buckets[idx].refresh_at = now + self.refresh_timeout;
    }

    /// Record a node we've heard from (query or response), per §4.4's
    /// insertion algorithm. Own id is ignored (a node never routes to
    /// itself).
    pub fn observe(&mut self, id: Id, addr: SocketAddr, now: Instant) -> Observation {
        loop {
            if id == self.own_id {
                return Observation::Updated;
            }
            let idx = self.bucket_index_for(&id);

            if let Some(pos) = self.buckets[idx].entries.iter().position(|e| e.id == id) {
                let entry = &mut self.buckets[idx].entries[pos];
                entry.addr = addr;
                entry.last_seen = now;
                entry.pinged = false;
                entry.bad = false;
                self.touch_refresh(idx, now);
                return Observation::Updated;
            }

            if self.buckets[idx].entries.len() < K {
                self.buckets[idx].entries.push(NodeEntry::new(id, addr, now));
                self.touch_refresh(idx, now);
                return Observation::Inserted;
            }

            if let Some(stale_pos) = self.buckets[idx]
                .entries
                .iter()
                .position(|e| e.bad && now.saturating_duration_since(e.last_seen) > self.node_timeout)
            {
                self.buckets[idx].entries.remove(stale_pos);
                self.buckets[idx].entries.push(NodeEntry::new(id, addr, now));
                self.touch_refresh(idx, now);
                return Observation::Inserted;
            }

            if self.bucket_contains(idx, &self.own_id) {
                self.split(idx, now);
                continue;
            }

            let oldest = self.buckets[idx]
                .entries
                .iter()
                .min_by_key(|e| e.last_seen)
                .cloned()
                .expect("bucket is full so it has at least one entry");
            return Observation::NeedsPing { target: oldest, candidate: NodeEntry::new(id, addr, now) };
        }
    }

    /// Split the bucket at `idx` at its midpoint, per §4.4. Only called
    /// when that bucket contains the node's own id.
    fn split(&mut self, idx: usize, now: Instant) {
        let first = self.buckets[idx].first;
        let upper = self.upper_bound(idx);
        let mid = first.midpoint(upper.as_ref());

        let mut lower_entries = Vec::new();
        let mut upper_entries = Vec::new();
        for entry in self.buckets[idx].entries.drain(..) {
            if entry.id.0 < mid.0 {
                lower_entries.push(entry);
            } else {
                upper_entries.push(entry);
            }
        }
        self.buckets[idx].entries = lower_entries;
        let new_bucket = Bucket { first: mid, entries: upper_entries, refresh_at: now + self.refresh_timeout };
        self.buckets.insert(idx + 1, new_bucket);
    }

    /// Resolve a [`Observation::NeedsPing`]: `target_responded` tells us
    /// whether the liveness ping to `target.id` succeeded.
    pub fn resolve_replacement(&mut self, target: &NodeEntry, candidate: NodeEntry, target_responded: bool, now: Instant) {
        let idx = self.bucket_index_for(&candidate.id);
        if target_responded {
            if let Some(e) = self.buckets[idx].entries.iter_mut().find(|e| e.id == target.id) {
                e.last_seen = now;
                e.pinged = false;
                e.bad = false;
            }
        } else if let Some(pos) = self.buckets[idx].entries.iter().position(|e| e.id == target.id) {
            self.buckets[idx].entries[pos] = candidate;
            self.touch_refresh(idx, now);
        }
    }

    /// Mark a known node's most recent liveness check as failed. Called by
    /// the transaction layer when a query to it times out (§4.3, §4.4).
    pub fn mark_failed(&mut self, id: &Id) {
        let idx = self.bucket_index_for(id);
        if let Some(e) = self.buckets[idx].entries.iter_mut().find(|e| e.id == *id) {
            e.bad = true;
            e.pinged = false;
        }
    }

    pub fn mark_pinged(&mut self, id: &Id) {
        let idx = self.bucket_index_for(id);
        if let Some(e) = self.buckets[idx].entries.iter_mut().find(|e| e.id == *id) {
            e.pinged = true;
        }
    }

    /// The `k` entries closest to `target` across the whole table, sorted
    /// nearest first, ties broken by smaller id then earlier `last_seen`
    /// (§4.5 "Tie-breaking").
    pub fn closest(&self, target: &Id, k: usize) -> Vec<NodeEntry> {
        let mut all: Vec<&NodeEntry> = self.buckets.iter().flat_map(|b| b.entries.iter()).collect();
        all.sort_by(|a, b| {
            let da = a.id.distance(target);
            let db = b.id.distance(target);
            da.cmp(&db).then_with(|| a.id.cmp(&b.id)).then_with(|| a.last_seen.cmp(&b.last_seen))
        });
        all.into_iter().take(k).cloned().collect()
    }

    /// Buckets whose refresh timer has fired, paired with a random target
    /// id drawn from their range (§4.4 "bucket refresh"). Resets each
    /// returned bucket's timer immediately so a slow-to-complete refresh
    /// search doesn't retrigger every tick.
    pub fn due_for_refresh(&mut self, now: Instant, rng: &mut impl RngCore) -> Vec<Id> {
        let mut due = Vec::new();
        for idx in 0..self.buckets.len() {
            if now >= self.buckets[idx].refresh_at {
                let first = self.buckets[idx].first;
                let upper = self.upper_bound(idx);
                due.push(Id::random_in_range(rng, &first, upper.as_ref()));
                self.touch_refresh(idx, now);
            }
        }
        due
    }

    /// Every invariant from §8 item 3, checked in one pass. Exposed for
    /// tests and for an optional runtime self-check; not called on the hot
    /// path.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.buckets.is_empty() {
            return Err("routing table has no buckets".into());
        }
        if self.buckets[0].first != Id::ZERO {
            return Err("first bucket does not start at 0".into());
        }
        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.entries.len() > K {
                return Err(format!("bucket {idx} exceeds capacity K"));
            }
            let upper = self.upper_bound(idx);
            for entry in &bucket.entries {
                if entry.id.0 < bucket.first.0 {
                    return Err(format!("entry below bucket {idx} lower bound"));
                }
                if let Some(upper) = upper {
                    if entry.id.0 >= upper.0 {
                        return Err(format!("entry above bucket {idx} upper bound"));
                    }
                }
            }
            if idx > 0 && bucket.first.0 <= self.buckets[idx - 1].first.0 {
                return Err(format!("bucket {idx} does not strictly follow bucket {}", idx - 1));
            }
        }
        Ok(())
    }
}

pub fn distance_between(a: &Id, b: &Id) -> Distance {
    a.distance(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn id_with_leading_byte(b: u8) -> Id {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        Id(bytes)
    }

    #[test]
    fn s2_split_at_midpoint() {
        let now = Instant::now();
        let own = Id::ZERO;
        let mut table = RoutingTable::new(own, now);

        for leading in [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80] {
            let obs = table.observe(id_with_leading_byte(leading), addr(leading as u16), now);
            assert!(matches!(obs, Observation::Inserted));
        }
        assert_eq!(table.len(), 8);
        assert_eq!(table.buckets().len(), 1);

        let new_node = id_with_leading_byte(0x90);
        let obs = table.observe(new_node, addr(0x90), now);
        assert!(matches!(obs, Observation::Inserted), "expected split+insert, got {obs:?}");

        assert_eq!(table.buckets().len(), 2);
        let mut expected_mid = [0u8; 20];
        expected_mid[0] = 0x80;
        assert_eq!(table.buckets()[1].first, Id(expected_mid));

        assert!(table.buckets()[1].entries.iter().any(|e| e.id == new_node));
        table.check_invariants().unwrap();
    }

    #[test]
    fn full_non_own_bucket_requests_ping_before_evicting() {
        let now = Instant::now();
        // Own id far from the bucket under test so it never gets split.
        let own = id_with_leading_byte(0xff);
        let mut table = RoutingTable::new(own, now);

        for i in 0..8u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x00;
            bytes[19] = i;
            table.observe(Id(bytes), addr(i as u16), now);
        }

        let mut candidate_bytes = [0u8; 20];
        candidate_bytes[0] = 0x00;
        candidate_bytes[19] = 200;
        let obs = table.observe(Id(candidate_bytes), addr(200), now + Duration::from_secs(1));
        match obs {
            Observation::NeedsPing { target, candidate } => {
                assert_eq!(candidate.id, Id(candidate_bytes));
                assert_eq!(target.last_seen, now);
            }
            other => panic!("expected NeedsPing, got {other:?}"),
        }
    }

    #[test]
    fn resolve_replacement_evicts_on_ping_failure() {
        let now = Instant::now();
        let own = id_with_leading_byte(0xff);
        let mut table = RoutingTable::new(own, now);
        for i in 0..8u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = i;
            table.observe(Id(bytes), addr(i as u16), now);
        }
        let mut candidate_bytes = [0u8; 20];
        candidate_bytes[19] = 200;
        let candidate_id = Id(candidate_bytes);
        let obs = table.observe(candidate_id, addr(200), now);
        let Observation::NeedsPing { target, candidate } = obs else { panic!("expected NeedsPing") };

        table.resolve_replacement(&target, candidate, false, now);
        assert!(table.closest(&candidate_id, 8).iter().any(|e| e.id == candidate_id));
        assert!(!table.closest(&target.id, 8).iter().any(|e| e.id == target.id));
    }

    #[test]
    fn closest_breaks_ties_by_smaller_id() {
        let now = Instant::now();
        let own = Id::ZERO;
        let mut table = RoutingTable::new(own, now);
        // Two ids equidistant from target=ZERO by construction: complements.
        let a = Id([0x0f; 20]);
        let b = {
            let mut bytes = [0x0f; 20];
            bytes[19] = 0x0e;
            Id(bytes)
        };
        table.observe(a, addr(1), now);
        table.observe(b, addr(2), now);
        let closest = table.closest(&Id::ZERO, 2);
        // b has smaller distance in the last byte, so it must come first.
        assert_eq!(closest[0].id, b);
    }

    #[test]
    fn bucket_refresh_fires_after_timeout() {
        let now = Instant::now();
        let mut table =
            RoutingTable::with_timeouts(Id::ZERO, now, Duration::from_secs(900), Duration::from_millis(10));
        let mut rng = rand::rngs::mock::StepRng::new(1, 1);
        assert!(table.due_for_refresh(now, &mut rng).is_empty());
        let later = now + Duration::from_millis(20);
        let due = table.due_for_refresh(later, &mut rng);
        assert_eq!(due.len(), 1);
    }
}
