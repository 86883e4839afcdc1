//! The core's public error boundary. Every fallible operation on [`crate::node::Node`]
//! and its collaborators returns `Result<T, DhtError>`; the surrounding
//! binary wraps these in `anyhow::Error` at the edges (SPEC_FULL §10.2).

use crate::bencode::BencodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("malformed KRPC message: {0}")]
    Protocol(String),

    #[error("query timed out")]
    QueryTimeout,

    #[error("search converged with no results")]
    SearchExhausted,

    #[error("signature verification failed")]
    SignatureError,

    #[error("hash does not match value")]
    HashMismatch,

    #[error("value encodes to more than the 1000-byte BEP-44 limit")]
    ValueTooLarge,

    #[error("salt exceeds the 64-byte BEP-44 limit")]
    SaltTooLong,

    #[error("seq is less than the stored seq")]
    SeqTooOld,

    #[error("equal seq but value does not match the stored value")]
    CasMismatch,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// KRPC error codes per BEP 5 / BEP 44, used when building an `e` response.
/// The `SignatureError`/`HashMismatch` codes follow §7's literal mapping
/// (`{203, "Bad Signature"}` / `{206, "Invalid Hash"}`), not the unrelated
/// numbering some BEP-44 implementations use for those two messages.
pub mod krpc_code {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const BAD_SIGNATURE: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
    pub const VALUE_TOO_LARGE: i64 = 205;
    pub const INVALID_HASH: i64 = 206;
    pub const SALT_TOO_LONG: i64 = 207;
    pub const CAS_MISMATCH: i64 = 301;
    pub const SEQ_TOO_OLD: i64 = 302;
}

impl DhtError {
    /// Maps a core error onto the KRPC error code a responder should send
    /// back. Errors with no wire representation (timeouts, cancellation)
    /// return `None` — they never cross the wire as `e` messages themselves.
    pub fn krpc_code(&self) -> Option<i64> {
        match self {
            DhtError::SignatureError => Some(krpc_code::BAD_SIGNATURE),
            DhtError::HashMismatch => Some(krpc_code::INVALID_HASH),
            DhtError::ValueTooLarge => Some(krpc_code::VALUE_TOO_LARGE),
            DhtError::SaltTooLong => Some(krpc_code::SALT_TOO_LONG),
            DhtError::SeqTooOld => Some(krpc_code::SEQ_TOO_OLD),
            DhtError::CasMismatch => Some(krpc_code::CAS_MISMATCH),
            DhtError::Protocol(_) => Some(krpc_code::PROTOCOL),
            _ => None,
        }
    }
}
