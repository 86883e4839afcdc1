//! Per-infohash lists of announced peers with expiry (§4.7).

use crate::consts::{MAX_PEERS_PER_RESPONSE, PEER_TIMEOUT};
use crate::id::Id;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

struct PeerRecord {
    addr: SocketAddr,
    expires_at: Instant,
}

pub struct PeerStore {
    by_hash: HashMap<Id, Vec<PeerRecord>>,
    peer_timeout: Duration,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::with_timeout(PEER_TIMEOUT)
    }

    pub fn with_timeout(peer_timeout: Duration) -> Self {
        PeerStore { by_hash: HashMap::new(), peer_timeout }
    }

    /// Insert a freshly-announced peer, or refresh its expiry if already
    /// present.
    pub fn announce(&mut self, info_hash: Id, addr: SocketAddr, now: Instant) {
        let expires_at = now + self.peer_timeout;
        let list = self.by_hash.entry(info_hash).or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.addr == addr) {
            existing.expires_at = expires_at;
        } else {
            list.push(PeerRecord { addr, expires_at });
        }
    }

    /// Up to [`MAX_PEERS_PER_RESPONSE`] live peers for `info_hash`, most
    /// recently announced first.
    pub fn get(&self, info_hash: &Id, now: Instant) -> Vec<SocketAddr> {
        self.by_hash
            .get(info_hash)
            .into_iter()
            .flatten()
            .filter(|p| p.expires_at > now)
            .take(MAX_PEERS_PER_RESPONSE)
            .map(|p| p.addr)
            .collect()
    }

    pub fn contains(&self, info_hash: &Id) -> bool {
        self.by_hash.get(info_hash).is_some_and(|v| !v.is_empty())
    }

    /// Drop expired peers and any infohash left with none (§8 item 6 /
    /// scenario S6).
    pub fn sweep(&mut self, now: Instant) {
        self.by_hash.retain(|_, peers| {
            peers.retain(|p| p.expires_at > now);
            !peers.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.by_hash.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries grouped by infohash, as (addr, remaining ttl) pairs, for
    /// the save file (§6).
    pub fn snapshot(&self, now: Instant) -> Vec<(Id, Vec<(SocketAddr, Duration)>)> {
        self.by_hash
            .iter()
            .filter_map(|(hash, records)| {
                let live: Vec<(SocketAddr, Duration)> = records
                    .iter()
                    .filter(|p| p.expires_at > now)
                    .map(|p| (p.addr, p.expires_at.saturating_duration_since(now)))
                    .collect();
                (!live.is_empty()).then_some((*hash, live))
            })
            .collect()
    }

    /// Reinsert a peer loaded from a save file, `ttl` being however much of
    /// its lease remained when the file was written.
    pub fn restore(&mut self, info_hash: Id, addr: SocketAddr, ttl: Duration, now: Instant) {
        self.by_hash.entry(info_hash).or_default().push(PeerRecord { addr, expires_at: now + ttl });
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> Id {
        Id([0xaa; 20])
    }

    fn peer_addr() -> SocketAddr {
        "198.51.100.7:51413".parse().unwrap()
    }

    #[test]
    fn s3_announce_and_get_peers() {
        let now = Instant::now();
        let mut store = PeerStore::new();
        store.announce(hash(), peer_addr(), now);
        assert_eq!(store.get(&hash(), now), vec![peer_addr()]);

        let second: SocketAddr = "198.51.100.9:6881".parse().unwrap();
        store.announce(hash(), second, now);
        let peers = store.get(&hash(), now);
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&second));
    }

    #[test]
    fn s6_expiry_at_two_hours() {
        let now = Instant::now();
        let mut store = PeerStore::with_timeout(Duration::from_secs(2 * 60 * 60));
        store.announce(hash(), peer_addr(), now);

        let just_before = now + Duration::from_secs(2 * 60 * 60) - Duration::from_secs(1);
        assert_eq!(store.get(&hash(), just_before), vec![peer_addr()]);

        let just_after = now + Duration::from_secs(2 * 60 * 60) + Duration::from_secs(1);
        assert!(store.get(&hash(), just_after).is_empty());

        store.sweep(just_after);
        assert!(!store.contains(&hash()));
    }

    #[test]
    fn reannounce_refreshes_expiry_instead_of_duplicating() {
        let now = Instant::now();
        let mut store = PeerStore::with_timeout(Duration::from_secs(100));
        store.announce(hash(), peer_addr(), now);
        store.announce(hash(), peer_addr(), now + Duration::from_secs(50));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&hash(), now + Duration::from_secs(120)), vec![peer_addr()]);
    }
}
