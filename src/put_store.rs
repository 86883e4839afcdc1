//! BEP-44 immutable and mutable item storage: hash-addressed blobs and
//! pubkey+salt-addressed signed, versioned blobs (§4.8).

use crate::bencode::BValue;
use crate::consts::{MAX_MUTABLE_VALUE_LEN, MAX_SALT_LEN, PUT_TIMEOUT};
use crate::crypto::Verifier;
use crate::error::DhtError;
use crate::id::Id;
use crate::wire::mutable_signature_input;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ImmutableItem {
    pub v: BValue,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct MutableItem {
    pub k: [u8; 32],
    pub salt: Option<Vec<u8>>,
    pub seq: i64,
    pub sig: [u8; 64],
    pub v: BValue,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub enum PutItem {
    Immutable(ImmutableItem),
    Mutable(MutableItem),
}

pub struct MutablePutRequest<'a> {
    pub k: [u8; 32],
    pub salt: Option<&'a [u8]>,
    pub seq: i64,
    pub sig: [u8; 64],
    pub v: BValue,
}

pub struct PutStore {
    items: HashMap<Id, PutItem>,
    put_timeout: Duration,
}

/// `SHA1(bencode(v))`, the immutable item's key (§3).
pub fn immutable_key(v: &BValue) -> Id {
    let digest = Sha1::digest(v.encode());
    Id::from_slice(&digest).expect("SHA-1 digest is 20 bytes")
}

/// `SHA1(k ‖ salt)`, the mutable item's key (§3).
pub fn mutable_key(k: &[u8; 32], salt: Option<&[u8]>) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(k);
    if let Some(salt) = salt {
        hasher.update(salt);
    }
    Id::from_slice(&hasher.finalize()).expect("SHA-1 digest is 20 bytes")
}

impl PutStore {
    pub fn new() -> Self {
        Self::with_timeout(PUT_TIMEOUT)
    }

    pub fn with_timeout(put_timeout: Duration) -> Self {
        PutStore { items: HashMap::new(), put_timeout }
    }

    /// Accept an immutable put. Rejects values over the BEP-44 size limit;
    /// otherwise always succeeds — the key is derived from `v`, so there is
    /// no caller-supplied hash to mismatch against (§4.8's "rejected if
    /// SHA1(bencode(v)) != hash" describes the *caller* validating its own
    /// target before writing, which is the search engine's job in §4.5's
    /// write phase, not the store's).
    pub fn put_immutable(&mut self, v: BValue, now: Instant) -> Result<Id, DhtError> {
        if v.encode().len() > MAX_MUTABLE_VALUE_LEN {
            return Err(DhtError::ValueTooLarge);
        }
        let key = immutable_key(&v);
        self.items.insert(key, PutItem::Immutable(ImmutableItem { v, expires_at: now + self.put_timeout }));
        Ok(key)
    }

    /// Accept or refresh a mutable put, enforcing BEP-44's signature,
    /// size, salt-length and seq-ordering rules (§4.8, §8 items 8-9).
    pub fn put_mutable(
        &mut self,
        req: MutablePutRequest,
        verifier: &dyn Verifier,
        now: Instant,
    ) -> Result<Id, DhtError> {
        if let Some(salt) = req.salt {
            if salt.len() > MAX_SALT_LEN {
                return Err(DhtError::SaltTooLong);
            }
        }
        if req.v.encode().len() > MAX_MUTABLE_VALUE_LEN {
            return Err(DhtError::ValueTooLarge);
        }

        let sig_input = mutable_signature_input(req.seq, req.salt, &req.v);
        if !verifier.verify(&req.k, &sig_input, &req.sig) {
            return Err(DhtError::SignatureError);
        }

        let key = mutable_key(&req.k, req.salt);
        if let Some(PutItem::Mutable(existing)) = self.items.get(&key) {
            if req.seq < existing.seq {
                return Err(DhtError::SeqTooOld);
            }
            if req.seq == existing.seq && req.v != existing.v {
                // Open question resolved per SPEC_FULL §9: equal seq with an
                // identical value is an idempotent accept, but a different
                // value at the same seq is a genuine conflict.
                return Err(DhtError::CasMismatch);
            }
        }

        self.items.insert(
            key,
            PutItem::Mutable(MutableItem {
                k: req.k,
                salt: req.salt.map(|s| s.to_vec()),
                seq: req.seq,
                sig: req.sig,
                v: req.v,
                expires_at: now + self.put_timeout,
            }),
        );
        Ok(key)
    }

    pub fn get(&self, key: &Id, now: Instant) -> Option<&PutItem> {
        let item = self.items.get(key)?;
        let expires_at = match item {
            PutItem::Immutable(i) => i.expires_at,
            PutItem::Mutable(m) => m.expires_at,
        };
        (expires_at > now).then_some(item)
    }

    pub fn sweep(&mut self, now: Instant) {
        self.items.retain(|_, item| match item {
            PutItem::Immutable(i) => i.expires_at > now,
            PutItem::Mutable(m) => m.expires_at > now,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Live items as (key, item, remaining ttl), for the save file (§6).
    pub fn snapshot(&self, now: Instant) -> Vec<(Id, PutItem, Duration)> {
        self.items
            .iter()
            .filter_map(|(key, item)| {
                let expires_at = match item {
                    PutItem::Immutable(i) => i.expires_at,
                    PutItem::Mutable(m) => m.expires_at,
                };
                (expires_at > now).then(|| (*key, item.clone(), expires_at.saturating_duration_since(now)))
            })
            .collect()
    }

    /// Reinsert an item loaded from a save file under its original key,
    /// resetting its expiry to `ttl` from `now`. Skips re-verifying the
    /// signature — it was checked when the item was first accepted, and the
    /// save file is trusted local state, not network input.
    pub fn restore(&mut self, key: Id, item: PutItem, ttl: Duration, now: Instant) {
        let expires_at = now + ttl;
        let item = match item {
            PutItem::Immutable(i) => PutItem::Immutable(ImmutableItem { v: i.v, expires_at }),
            PutItem::Mutable(m) => PutItem::Mutable(MutableItem { expires_at, ..m }),
        };
        self.items.insert(key, item);
    }
}

impl Default for PutStore {
    fn default() -> Self {
        Self::new()
    }
}
