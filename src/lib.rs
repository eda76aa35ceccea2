//! # Cascade
//!
//! A DAG-structured, stake-weighted consensus ledger core:
//! - **Transaction DAG** — multi-parent ancestry graph indexed by depth
//! - **Collapse engine** — deterministic fold of a DAG range into account state
//! - **Snowball voting** — stake-weighted repeated-sampling finalization
//! - **Authenticated state tree** — copy-on-write map whose 16-byte checksum
//!   is the identity of every finalized round
//! - **Inception dumps** — deterministic genesis serialization and restore
//!
//! The gateway, peer transport, and contract runtime are consumed as
//! capabilities (`Kv`, `ContractVm`, `Broadcaster`) so any conforming
//! backend can be substituted.

pub mod accounts;
pub mod collapse;
pub mod config;
pub mod conflict;
pub mod genesis;
pub mod graph;
pub mod identity;
pub mod ledger;
pub mod round;
pub mod snowball;
pub mod store;
pub mod transaction;
pub mod tree;
pub mod vm;
pub mod vote;

/// Protocol constants
pub mod constants {
    /// Base fee charged for any transaction (in base units)
    pub const TX_FEE_BASE: u64 = 2;
    /// One extra fee unit is charged per this many payload bytes
    pub const TX_FEE_BYTE_DIVISOR: u64 = 64;
    /// Maximum number of parent references per transaction
    pub const MAX_PARENTS: usize = 32;
    /// Maximum transaction payload size in bytes (256 KiB)
    pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;
    /// Number of contract VM states cached per collapse
    pub const VM_CACHE_CAPACITY: usize = 4;
    /// Default floor applied to a voter's stake before vote weighting
    pub const DEFAULT_MINIMUM_STAKE: u64 = 100;
    /// Default fraction of stake weight required to win a sync vote batch
    pub const DEFAULT_SYNC_VOTE_THRESHOLD: f64 = 0.8;
    /// Default Snowball stability threshold
    pub const DEFAULT_BETA1: u32 = 10;
    /// Default Snowball quorum threshold
    pub const DEFAULT_BETA2: u32 = 150;
    /// Default number of votes sampled per voting batch
    pub const DEFAULT_SNOWBALL_K: usize = 2;
    /// Default contract memory page size in bytes (one wasm page)
    pub const DEFAULT_PAGE_SIZE: usize = 65_536;
    /// Default settlement delay for reward withdrawals, in rounds
    pub const DEFAULT_REWARD_WITHDRAWALS_ROUND_LIMIT: u64 = 30;
    /// Collapse driver tick interval in milliseconds
    pub const DEFAULT_COLLAPSE_INTERVAL_MS: u64 = 500;
    /// Accepted-transaction update tick interval in milliseconds
    pub const DEFAULT_ACCEPT_INTERVAL_MS: u64 = 100;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Cascade domains use ASCII). Panics at
/// runtime if it is not; that is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
