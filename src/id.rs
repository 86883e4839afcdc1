//! 160-bit node/info-hash identifiers and the XOR distance metric Kademlia
//! routing is built on.

use rand::RngCore;
use std::fmt;

pub const ID_LEN: usize = 20;

/// One byte wider than [`Id`] so `2^160` itself (the exclusive upper bound
/// of the whole id space, which no `Id` value can represent) has a home.
/// Only used internally for midpoint/range arithmetic.
type Extended = [u8; ID_LEN + 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);
    pub const MAX: Id = Id([0xff; ID_LEN]);

    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; ID_LEN];
        rng.fill_bytes(&mut bytes);
        Id(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(bytes);
        Some(Id(out))
    }

    /// XOR distance, interpreted as a big-endian 160-bit integer.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    fn extend(&self) -> Extended {
        let mut out = [0u8; ID_LEN + 1];
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// `2^160`, the exclusive upper bound of the whole id space.
    fn space_end() -> Extended {
        let mut out = [0u8; ID_LEN + 1];
        out[0] = 1;
        out
    }

    fn extended_of(bound: Option<&Id>) -> Extended {
        bound.map(Id::extend).unwrap_or_else(Id::space_end)
    }

    fn truncate(ext: &Extended) -> Id {
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&ext[1..]);
        Id(out)
    }

    /// The midpoint of `[self, upper)`, where `upper = None` means the top
    /// of the id space (`2^160`). Used to split a bucket in two (§4.4).
    pub fn midpoint(&self, upper: Option<&Id>) -> Id {
        let sum = add_extended(&self.extend(), &Id::extended_of(upper));
        Id::truncate(&halve_extended(&sum))
    }

    /// A uniformly-sampled id in `[low, high)` (`high = None` meaning the
    /// top of the id space). Used to pick bucket-refresh search targets
    /// (§4.4). Falls back to returning `low` if the range is vanishingly
    /// small and rejection sampling doesn't land inside it quickly — a
    /// refresh target anywhere in the bucket's range is acceptable, it
    /// need not be uniformly distributed in that degenerate case.
    pub fn random_in_range(rng: &mut impl RngCore, low: &Id, high: Option<&Id>) -> Self {
        for _ in 0..256 {
            let candidate = Id::random(rng);
            let below_high = match high {
                Some(h) => candidate.0 < h.0,
                None => true,
            };
            if candidate.0 >= low.0 && below_high {
                return candidate;
            }
        }
        *low
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

fn add_extended(a: &Extended, b: &Extended) -> Extended {
    let mut out = [0u8; ID_LEN + 1];
    let mut carry = 0u16;
    for i in (0..=ID_LEN).rev() {
        let sum = a[i] as u16 + b[i] as u16 + carry;
        out[i] = (sum & 0xff) as u8;
        carry = sum >> 8;
    }
    out
}

fn halve_extended(a: &Extended) -> Extended {
    let mut out = [0u8; ID_LEN + 1];
    let mut carry = 0u8;
    for i in 0..=ID_LEN {
        out[i] = (carry << 7) | (a[i] >> 1);
        carry = a[i] & 1;
    }
    out
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_LEN]);

impl Distance {
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id([7u8; ID_LEN]);
        assert_eq!(id.distance(&id), Distance([0u8; ID_LEN]));
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Id([1u8; ID_LEN]);
        let b = Id([2u8; ID_LEN]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn ordering_matches_big_endian_integer_order() {
        let mut small = [0u8; ID_LEN];
        small[0] = 0x10;
        let mut large = [0u8; ID_LEN];
        large[0] = 0x20;
        assert!(Id(small) < Id(large));
    }

    #[test]
    fn random_in_range_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut low = [0u8; ID_LEN];
        low[0] = 0x10;
        let mut high = [0u8; ID_LEN];
        high[0] = 0x20;
        for _ in 0..50 {
            let id = Id::random_in_range(&mut rng, &Id(low), Some(&Id(high)));
            assert!(id.0 >= low && id.0 < high);
        }
    }

    #[test]
    fn random_in_range_accepts_unbounded_high() {
        let mut rng = StdRng::seed_from_u64(7);
        let low = Id::ZERO;
        let id = Id::random_in_range(&mut rng, &low, None);
        assert!(id.0 >= low.0);
    }

    #[test]
    fn midpoint_of_full_space_is_0x80() {
        let mut expected = [0u8; ID_LEN];
        expected[0] = 0x80;
        assert_eq!(Id::ZERO.midpoint(None), Id(expected));
    }

    #[test]
    fn midpoint_s2_example() {
        // own id = 0, bucket covers [0, 2^160); splitting at the midpoint
        // must produce 0x80...00 per the spec's worked example (S2).
        let mid = Id::ZERO.midpoint(None);
        let mut expected = [0u8; ID_LEN];
        expected[0] = 0x80;
        assert_eq!(mid, Id(expected));
    }
}
