//! Bencode codec: the four value kinds used by every on-wire and on-disk
//! structure in this crate (integer, byte string, list, dictionary).
//!
//! Dictionaries are kept as parallel ordered arrays, not a `BTreeMap` — the
//! wire form's canonical ordering is the only ordering we need, and decoding
//! into a sorted `Vec` lets us verify "strictly ascending keys" as we go
//! instead of as a separate pass.

use std::fmt;

pub const DEFAULT_MAX_DEPTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid length prefix")]
    InvalidLength,
    #[error("integer has a leading zero")]
    LeadingZero,
    #[error("integer is negative zero")]
    NegativeZero,
    #[error("duplicate dictionary key")]
    DuplicateKey,
    #[error("dictionary keys are not strictly ascending")]
    UnsortedKeys,
    #[error("trailing data after top-level value")]
    TrailingData,
    #[error("unterminated container")]
    UnterminatedContainer,
    #[error("nesting depth exceeds limit")]
    DepthExceeded,
    #[error("unrecognized value tag")]
    InvalidTag,
}

/// A bencoded value: integer, byte string, list, or dictionary.
///
/// Dictionary entries are stored pre-sorted by key; [`BValue::dict`] and
/// [`BValue::set`] are the only ways to build one up without re-deriving
/// that invariant by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BValue>),
    Dict(Vec<(Vec<u8>, BValue)>),
}

impl BValue {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        BValue::Bytes(b.into())
    }

    pub fn dict() -> Self {
        BValue::Dict(Vec::new())
    }

    /// Insert or replace `key` in a dictionary value, preserving sort order.
    /// Panics if called on a non-dict — this is a builder helper, not a
    /// general accessor.
    pub fn set(&mut self, key: &[u8], value: BValue) {
        let BValue::Dict(entries) = self else {
            panic!("BValue::set called on a non-dictionary value");
        };
        match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(idx) => entries[idx].1 = value,
            Err(idx) => entries.insert(idx, (key.to_vec(), value)),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BValue]> {
        match self {
            BValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&BValue> {
        match self {
            BValue::Dict(entries) => entries
                .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                .ok()
                .map(|idx| &entries[idx].1),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(BValue::as_bytes)
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(BValue::as_int)
    }

    pub fn get_dict(&self, key: &[u8]) -> Option<&BValue> {
        self.get(key).filter(|v| matches!(v, BValue::Dict(_)))
    }

    pub fn get_list(&self, key: &[u8]) -> Option<&[BValue]> {
        self.get(key).and_then(BValue::as_list)
    }

    /// Encode canonically: dictionary keys strictly ascending, no redundant
    /// padding anywhere. `decode(encode(v)) == v` always holds for any value
    /// built through this API.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BValue::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BValue::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            BValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BValue::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

impl fmt::Display for BValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.encode()))
    }
}

/// Decode a single top-level value, rejecting any trailing bytes.
pub fn decode(input: &[u8]) -> Result<BValue, BencodeError> {
    decode_with_limit(input, DEFAULT_MAX_DEPTH)
}

pub fn decode_with_limit(input: &[u8], max_depth: usize) -> Result<BValue, BencodeError> {
    let mut dec = Decoder {
        buf: input,
        pos: 0,
        max_depth,
    };
    let value = dec.parse_value(0)?;
    if dec.pos != dec.buf.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decode a single value as a prefix of a larger stream, returning the value
/// and the number of bytes it consumed. Used by callers that read a whole
/// UDP datagram but only expect one bencoded message from it (which is
/// every caller in this crate, but the distinction matters for future
/// multi-value streams such as the save file).
pub fn decode_prefix(input: &[u8]) -> Result<(BValue, usize), BencodeError> {
    let mut dec = Decoder {
        buf: input,
        pos: 0,
        max_depth: DEFAULT_MAX_DEPTH,
    };
    let value = dec.parse_value(0)?;
    Ok((value, dec.pos))
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.buf.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn parse_value(&mut self, depth: usize) -> Result<BValue, BencodeError> {
        if depth > self.max_depth {
            return Err(BencodeError::DepthExceeded);
        }
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dict(depth),
            b'0'..=b'9' => self.parse_bytes().map(BValue::Bytes),
            _ => Err(BencodeError::InvalidTag),
        }
    }

    fn parse_int(&mut self) -> Result<BValue, BencodeError> {
        debug_assert_eq!(self.buf[self.pos], b'i');
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1; // consume 'e'

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidLength)?;
        let (negative, magnitude) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BencodeError::InvalidLength);
        }
        if magnitude == "0" && negative {
            return Err(BencodeError::NegativeZero);
        }
        if magnitude.len() > 1 && magnitude.starts_with('0') {
            return Err(BencodeError::LeadingZero);
        }
        let value: i64 = text.parse().map_err(|_| BencodeError::InvalidLength)?;
        Ok(BValue::Int(value))
    }

    fn parse_usize_prefix(&mut self) -> Result<usize, BencodeError> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(BencodeError::InvalidLength);
        }
        let digits = &self.buf[start..self.pos];
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::InvalidLength);
        }
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidLength)?;
        text.parse().map_err(|_| BencodeError::InvalidLength)
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let len = self.parse_usize_prefix()?;
        if self.peek()? != b':' {
            return Err(BencodeError::InvalidLength);
        }
        self.pos += 1;
        let end = self.pos.checked_add(len).ok_or(BencodeError::InvalidLength)?;
        if end > self.buf.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let out = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }

    fn parse_list(&mut self, depth: usize) -> Result<BValue, BencodeError> {
        debug_assert_eq!(self.buf[self.pos], b'l');
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(BValue::List(items));
            }
            items.push(self.parse_value(depth + 1)?);
        }
    }

    fn parse_dict(&mut self, depth: usize) -> Result<BValue, BencodeError> {
        debug_assert_eq!(self.buf[self.pos], b'd');
        self.pos += 1;
        let mut entries: Vec<(Vec<u8>, BValue)> = Vec::new();
        let mut prev_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(BValue::Dict(entries));
            }
            let key = self.parse_bytes()?;
            if let Some(prev) = &prev_key {
                match key.as_slice().cmp(prev.as_slice()) {
                    std::cmp::Ordering::Equal => return Err(BencodeError::DuplicateKey),
                    std::cmp::Ordering::Less => return Err(BencodeError::UnsortedKeys),
                    std::cmp::Ordering::Greater => {}
                }
            }
            let value = self.parse_value(depth + 1)?;
            prev_key = Some(key.clone());
            entries.push((key, value));
        }
    }
}

// The `peek`-then-consume loops above treat running off the end of the
// buffer inside a container as `UnexpectedEof`, which doubles as the
// "unterminated container" case from the spec — there is no separate
// terminator check because the loop condition *is* the terminator check.

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn roundtrip_s1_example() {
        let mut dict = BValue::dict();
        dict.set(b"a", BValue::Int(1));
        dict.set(b"b", BValue::List(vec![BValue::Int(2), BValue::bytes(b("x"))]));
        let encoded = dict.encode();
        assert_eq!(encoded, b"d1:ai1e1:bli2e1:xee");
        assert_eq!(decode(&encoded).unwrap(), dict);
    }

    #[test]
    fn roundtrip_string_with_nul() {
        let v = BValue::bytes(vec![0, 1, 2, b'x', 0]);
        assert_eq!(decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn decode_rejects_negative_zero() {
        assert_eq!(decode(b"i-0e"), Err(BencodeError::NegativeZero));
    }

    #[test]
    fn decode_rejects_leading_zero() {
        assert_eq!(decode(b"i03e"), Err(BencodeError::LeadingZero));
    }

    #[test]
    fn decode_accepts_i0e() {
        assert_eq!(decode(b"i0e").unwrap(), BValue::Int(0));
    }

    #[test]
    fn decode_rejects_duplicate_key() {
        assert_eq!(decode(b"d1:a1:x1:a1:ye"), Err(BencodeError::DuplicateKey));
    }

    #[test]
    fn decode_rejects_unsorted_keys() {
        assert_eq!(decode(b"d1:b0:1:a0:e"), Err(BencodeError::UnsortedKeys));
    }

    #[test]
    fn decode_rejects_truncated_string() {
        assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn decode_rejects_unterminated_list() {
        assert_eq!(decode(b"li1ei2e"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        assert_eq!(decode(b"i1eXYZ"), Err(BencodeError::TrailingData));
    }

    #[test]
    fn decode_prefix_allows_trailing_bytes() {
        let (value, used) = decode_prefix(b"i1eXYZ").unwrap();
        assert_eq!(value, BValue::Int(1));
        assert_eq!(used, 3);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut payload = Vec::new();
        for _ in 0..200 {
            payload.push(b'l');
        }
        payload.extend_from_slice(b"i1e");
        for _ in 0..200 {
            payload.push(b'e');
        }
        assert_eq!(decode(&payload), Err(BencodeError::DepthExceeded));
    }

    #[test]
    fn set_replaces_existing_key_in_place() {
        let mut dict = BValue::dict();
        dict.set(b"id", BValue::bytes(b("one")));
        dict.set(b"id", BValue::bytes(b("two")));
        assert_eq!(dict.get_bytes(b"id"), Some(b("two").as_slice()));
        let BValue::Dict(entries) = &dict else { unreachable!() };
        assert_eq!(entries.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_roundtrip_arbitrary_values(v in arb_value(4)) {
            use proptest::prop_assert_eq;
            let encoded = v.encode();
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, v);
        }
    }

    fn arb_value(depth: u32) -> impl proptest::strategy::Strategy<Value = BValue> {
        use proptest::prelude::*;
        let leaf = prop_oneof![
            any::<i64>().prop_map(BValue::Int),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(BValue::Bytes),
        ];
        if depth == 0 {
            leaf.boxed()
        } else {
            leaf.prop_recursive(depth, 32, 8, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..6).prop_map(BValue::List),
                    proptest::collection::btree_map(
                        proptest::collection::vec(any::<u8>(), 0..8),
                        inner,
                        0..6,
                    )
                    .prop_map(|m| BValue::Dict(m.into_iter().collect())),
                ]
            })
            .boxed()
        }
    }
}
