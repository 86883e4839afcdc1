//! Fixed parameters and default timeouts (§3, §4.5, §9 "Open question").
//!
//! These are defaults a [`crate::config::Config`] can override for tests or
//! deployment tuning, not compile-time-only constants — §10.3 asks for
//! exactly that split.

use std::time::Duration;

/// Bucket capacity / result-set width ("K" in Kademlia literature,
/// `SEARCH_RESULT_MAX` in the source this was distilled from).
pub const K: usize = 8;

/// Search parallelism. The source left this unfixed; SPEC_FULL §9 fixes it
/// at 3 per the spec's own recommendation.
pub const ALPHA: usize = 3;

/// Upper bound on the candidate set kept per search before truncating back
/// to the K closest (§4.5).
pub const SEARCH_CANDIDATE_CAP: usize = 64;

/// Hard ceiling on total queries issued by one search, guarding against
/// pathological topologies (§4.5).
pub const SEARCH_QUERY_CEILING: usize = 128;

pub const BUCKET_NODE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const BUCKET_REFRESH_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const SEARCH_ITERATION_TIMEOUT: Duration = Duration::from_secs(1);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const SEARCH_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const PUT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Token secret rotation period and how many past generations remain valid
/// (§4.6: "refreshed every 5 min, two generations retained").
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const TOKEN_GENERATIONS: usize = 2;

/// Max peers returned per `get_peers` response (§4.7).
pub const MAX_PEERS_PER_RESPONSE: usize = 50;

/// BEP-44 limits (§4.8).
pub const MAX_MUTABLE_VALUE_LEN: usize = 1000;
pub const MAX_SALT_LEN: usize = 64;
