//! Tunables for the index and replicator, gathered in one struct per Design
//! Note 9 ("avoid process-wide globals"), following the teacher commitlog
//! crate's `Options` struct: a plain, `Default`-documented configuration
//! value passed explicitly to constructors. Loading it from a file or the
//! environment is out of scope here.

use serde::{Deserialize, Serialize};

/// Configuration shared by [`crate::index::IndexService`] and the
/// replication components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerHaConfig {
    /// Number of hash buckets in each new index file.
    ///
    /// Default: 5,000,000 (matches common broker defaults for this kind of
    /// hash-by-key index).
    pub hash_slot_count: u32,
    /// Maximum number of entries each index file can hold before rollover.
    ///
    /// Default: 20,000,000.
    pub max_index_count: u32,
    /// Upper bound on the number of offsets a single query may return,
    /// regardless of the caller's requested `max_count`.
    ///
    /// Default: 64.
    pub max_query_count: u32,
    /// Number of rollover retries `build_index` attempts before latching
    /// "index unwritable".
    ///
    /// Default: 3.
    pub rollover_retries: u32,
    /// Sleep between rollover retries.
    ///
    /// Default: 1 s.
    pub rollover_retry_interval_ms: u64,
    /// Size of the slave-side double-buffer used to reassemble replication
    /// frames.
    ///
    /// Default: 4 MiB.
    pub replication_buffer_len: usize,
    /// Maximum number of log bytes framed into a single push from master to
    /// slave.
    ///
    /// Default: 32 KiB.
    pub max_push_frame_len: u32,
    /// Interval at which a slave sends a heartbeat offset report if it has
    /// not otherwise advanced.
    ///
    /// Default: 5 s.
    pub slave_heartbeat_interval_ms: u64,
    /// How far behind `push2slave_max_offset` a master's write offset may
    /// fall while still considering the slave "ok".
    ///
    /// Default: 256 KiB.
    pub fallbehind_max: i64,
    /// Number of 1 s waits the group-commit gate performs per request
    /// before giving up.
    ///
    /// Default: 5.
    pub group_commit_wait_rounds: u32,
    pub group_commit_wait_interval_ms: u64,
}

impl Default for BrokerHaConfig {
    fn default() -> Self {
        Self {
            hash_slot_count: 5_000_000,
            max_index_count: 20_000_000,
            max_query_count: 64,
            rollover_retries: 3,
            rollover_retry_interval_ms: 1_000,
            replication_buffer_len: 4 * 1024 * 1024,
            max_push_frame_len: 32 * 1024,
            slave_heartbeat_interval_ms: 5_000,
            fallbehind_max: 256 * 1024,
            group_commit_wait_rounds: 5,
            group_commit_wait_interval_ms: 1_000,
        }
    }
}
