//! The on-disk save file: a bencoded dict capturing enough state to rejoin
//! the DHT without a cold start after a restart (§6, §10.4).
//!
//! The routing table is flattened to a plain node list rather than its exact
//! bucket partitioning — buckets are rebuilt from scratch by re-observing
//! each node, which is simpler than reconstructing split history and
//! produces an equivalent table once a handful of queries have landed.

use crate::id::Id;
use crate::bencode::{self, BValue};
use crate::put_store::{ImmutableItem, MutableItem, PutItem};
use crate::wire::{encode_compact_nodes, parse_compact_nodes};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const SAVE_VERSION: i64 = 2;

/// Everything the save file carries, decoupled from `Node` so the codec can
/// be tested without a socket or a clock.
pub struct SaveData {
    pub id: Id,
    pub nodes: Vec<(Id, SocketAddr)>,
    pub peers: Vec<(Id, Vec<(SocketAddr, Duration)>)>,
    pub items: Vec<(Id, PutItem, Duration)>,
}

pub fn encode(data: &SaveData) -> Vec<u8> {
    let mut top = BValue::dict();
    top.set(b"version", BValue::Int(SAVE_VERSION));
    top.set(b"id", BValue::bytes(data.id.as_bytes().to_vec()));
    top.set(b"buckets", encode_buckets(&data.nodes));
    top.set(b"peers", encode_peers(&data.peers));
    top.set(b"items", encode_items(&data.items));
    top.encode()
}

fn encode_buckets(nodes: &[(Id, SocketAddr)]) -> BValue {
    // One synthetic bucket spanning the whole id space; see module doc.
    let entry = BValue::List(vec![BValue::bytes(Id::ZERO.as_bytes().to_vec()), BValue::bytes(encode_compact_nodes(nodes))]);
    BValue::List(vec![entry])
}

fn encode_peers(peers: &[(Id, Vec<(SocketAddr, Duration)>)]) -> BValue {
    let list = peers
        .iter()
        .map(|(hash, entries)| {
            let peer_list = entries
                .iter()
                .map(|(addr, ttl)| {
                    BValue::List(vec![BValue::bytes(crate::wire::encode_compact_peer(*addr)), BValue::Int(ttl.as_secs() as i64)])
                })
                .collect();
            BValue::List(vec![BValue::bytes(hash.as_bytes().to_vec()), BValue::List(peer_list)])
        })
        .collect();
    BValue::List(list)
}

fn encode_items(items: &[(Id, PutItem, Duration)]) -> BValue {
    let list = items
        .iter()
        .map(|(key, item, ttl)| {
            let mut dict = BValue::dict();
            dict.set(b"key", BValue::bytes(key.as_bytes().to_vec()));
            dict.set(b"ttl", BValue::Int(ttl.as_secs() as i64));
            match item {
                PutItem::Immutable(i) => {
                    dict.set(b"v", i.v.clone());
                }
                PutItem::Mutable(m) => {
                    dict.set(b"v", m.v.clone());
                    dict.set(b"k", BValue::bytes(m.k.to_vec()));
                    if let Some(salt) = &m.salt {
                        dict.set(b"salt", BValue::bytes(salt.clone()));
                    }
                    dict.set(b"seq", BValue::Int(m.seq));
                    dict.set(b"sig", BValue::bytes(m.sig.to_vec()));
                }
            }
            dict
        })
        .collect();
    BValue::List(list)
}

/// Decode a save file. A version mismatch is reported as `Ok(None)` rather
/// than an error — the caller logs a warning and starts fresh (§10.4), it
/// isn't a malformed-file condition.
pub fn decode(raw: &[u8]) -> Result<Option<SaveData>, bencode::BencodeError> {
    let top = bencode::decode(raw)?;

    if top.get_int(b"version") != Some(SAVE_VERSION) {
        return Ok(None);
    }
    let Some(id) = top.get_bytes(b"id").and_then(Id::from_slice) else {
        return Ok(None);
    };

    let nodes = top.get_list(b"buckets").map(decode_buckets).unwrap_or_default();
    let peers = top.get_list(b"peers").map(decode_peers).unwrap_or_default();
    let items = top.get_list(b"items").map(decode_items).unwrap_or_default();

    Ok(Some(SaveData { id, nodes, peers, items }))
}

fn decode_buckets(list: &[BValue]) -> Vec<(Id, SocketAddr)> {
    list.iter()
        .filter_map(|entry| entry.as_list())
        .flat_map(|pair| pair.get(1).and_then(BValue::as_bytes).map(parse_compact_nodes).unwrap_or_default())
        .collect()
}

fn decode_peers(list: &[BValue]) -> Vec<(Id, Vec<(SocketAddr, Duration)>)> {
    list.iter()
        .filter_map(|entry| {
            let pair = entry.as_list()?;
            let hash = pair.first()?.as_bytes().and_then(Id::from_slice)?;
            let peer_list = pair.get(1)?.as_list()?;
            let peers = peer_list
                .iter()
                .filter_map(|p| {
                    let p = p.as_list()?;
                    let addr = p.first()?.as_bytes().and_then(crate::wire::parse_compact_peer)?;
                    let ttl = Duration::from_secs(p.get(1)?.as_int()? as u64);
                    Some((addr, ttl))
                })
                .collect();
            Some((hash, peers))
        })
        .collect()
}

fn decode_items(list: &[BValue]) -> Vec<(Id, PutItem, Duration)> {
    list.iter()
        .filter_map(|entry| {
            let key = entry.get_bytes(b"key").and_then(Id::from_slice)?;
            let ttl = Duration::from_secs(entry.get_int(b"ttl")? as u64);
            let v = entry.get(b"v")?.clone();
            let item = match entry.get_bytes(b"k") {
                Some(k) => {
                    let k: [u8; 32] = k.try_into().ok()?;
                    let salt = entry.get_bytes(b"salt").map(|s| s.to_vec());
                    let seq = entry.get_int(b"seq")?;
                    let sig: [u8; 64] = entry.get_bytes(b"sig")?.try_into().ok()?;
                    // expires_at is a throwaway here — PutStore::restore recomputes it
                    // from `ttl` against the caller's clock.
                    PutItem::Mutable(MutableItem { k, salt, seq, sig, v, expires_at: Instant::now() })
                }
                None => PutItem::Immutable(ImmutableItem { v, expires_at: Instant::now() }),
            };
            Some((key, item, ttl))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        "127.0.0.1:0".parse::<SocketAddr>().map(|a| SocketAddr::new(a.ip(), port)).unwrap()
    }

    #[test]
    fn roundtrips_nodes_peers_and_immutable_item() {
        let id = Id([7u8; 20]);
        let node_id = Id([9u8; 20]);
        let hash = Id([1u8; 20]);
        let item_key = Id([2u8; 20]);

        let data = SaveData {
            id,
            nodes: vec![(node_id, addr(6881))],
            peers: vec![(hash, vec![(addr(6882), Duration::from_secs(120))])],
            items: vec![(
                item_key,
                PutItem::Immutable(ImmutableItem { v: BValue::bytes(b"x".to_vec()), expires_at: Instant::now() }),
                Duration::from_secs(30),
            )],
        };

        let encoded = encode(&data);
        let decoded = decode(&encoded).unwrap().expect("version matches");
        assert_eq!(decoded.id, id);
        assert_eq!(decoded.nodes, vec![(node_id, addr(6881))]);
        assert_eq!(decoded.peers.len(), 1);
        assert_eq!(decoded.peers[0].0, hash);
        assert_eq!(decoded.peers[0].1, vec![(addr(6882), Duration::from_secs(120))]);
        assert_eq!(decoded.items.len(), 1);
        match &decoded.items[0].1 {
            PutItem::Immutable(i) => assert_eq!(i.v, BValue::bytes(b"x".to_vec())),
            _ => panic!("expected immutable item"),
        }
    }

    #[test]
    fn version_mismatch_yields_none() {
        let mut dict = BValue::dict();
        dict.set(b"version", BValue::Int(1));
        dict.set(b"id", BValue::bytes(vec![0u8; 20]));
        assert!(decode(&dict.encode()).unwrap().is_none());
    }
}
