//! Write tokens: short-lived proof that a querier's address was seen
//! recently, required before `announce_peer` / `put` are honored (§4.6).

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::consts::{TOKEN_GENERATIONS, TOKEN_ROTATE_INTERVAL};

type HmacSha1 = Hmac<Sha1>;

const SECRET_LEN: usize = 20;

pub struct TokenIssuer {
    rotate_interval: Duration,
    /// Most recent secret first. Capped at [`TOKEN_GENERATIONS`].
    generations: Vec<[u8; SECRET_LEN]>,
    next_rotation: Instant,
}

impl TokenIssuer {
    pub fn new(now: Instant, rng: &mut impl RngCore) -> Self {
        Self::with_interval(now, rng, TOKEN_ROTATE_INTERVAL)
    }

    pub fn with_interval(now: Instant, rng: &mut impl RngCore, rotate_interval: Duration) -> Self {
        TokenIssuer {
            rotate_interval,
            generations: vec![random_secret(rng)],
            next_rotation: now + rotate_interval,
        }
    }

    /// Roll the secret forward if the rotation interval has elapsed.
    pub fn tick(&mut self, now: Instant, rng: &mut impl RngCore) {
        if now < self.next_rotation {
            return;
        }
        self.generations.insert(0, random_secret(rng));
        self.generations.truncate(TOKEN_GENERATIONS);
        self.next_rotation = now + self.rotate_interval;
    }

    /// When this issuer's secret will next roll over, for the event loop's
    /// wake-time computation (§4.9).
    pub fn next_rotation(&self) -> Instant {
        self.next_rotation
    }

    pub fn issue(&self, addr: SocketAddr) -> Vec<u8> {
        mac_for(&self.generations[0], addr)
    }

    /// Accepted iff it matches the token we'd compute for `addr` under the
    /// current secret or any retained previous one (§8 item 7).
    pub fn verify(&self, addr: SocketAddr, token: &[u8]) -> bool {
        self.generations.iter().any(|secret| mac_for(secret, addr) == token)
    }
}

fn random_secret(rng: &mut impl RngCore) -> [u8; SECRET_LEN] {
    let mut out = [0u8; SECRET_LEN];
    rng.fill_bytes(&mut out);
    out
}

fn mac_for(secret: &[u8; SECRET_LEN], addr: SocketAddr) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
    match addr {
        SocketAddr::V4(v4) => {
            mac.update(&v4.ip().octets());
            mac.update(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            mac.update(&v6.ip().octets());
            mac.update(&v6.port().to_be_bytes());
        }
    }
    mac.finalize().into_bytes().to_vec()
}
