//! Configuration files.

use aqua_interfaces::sync::SyncMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the aqua node.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Chain synchronisation.
    pub sync: SyncConfig,
}

/// How and how aggressively the chain is synchronised.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// The requested sync mode.
    pub mode: SyncMode,
    /// Tuning of the block downloader.
    pub downloader: DownloaderConfig,
}

/// Tuning knobs of the block downloader.
///
/// The defaults are tuned for a chain with a block time of around 15 seconds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Maximum chain reorganisation depth accepted from a peer.
    pub max_fork_ancestry: u64,
    /// Maximum number of blocks held in the result cache at once.
    pub block_cache_items: usize,
    /// Number of headers requested per request, and the spacing of skeleton headers.
    pub max_header_fetch: u64,
    /// Number of headers in a skeleton request.
    pub max_skeleton_size: u64,
    /// Maximum number of bodies requested per request.
    pub max_block_fetch: usize,
    /// Maximum number of receipt lists requested per request.
    pub max_receipt_fetch: usize,
    /// Maximum number of state nodes requested per request.
    pub max_state_fetch: usize,
    /// Number of headers imported or scheduled in one chunk.
    pub max_headers_process: usize,
    /// Maximum number of results handed to chain insertion at once.
    pub max_results_process: usize,
    /// Header scheduling pauses while this many blocks or receipts are waiting to be fetched.
    pub max_queued_headers: usize,
    /// Seal verification frequency of headers imported during fast sync.
    pub fs_header_check_frequency: usize,
    /// Number of recently imported unverified headers dropped when fast sync is aborted.
    pub fs_header_safety_net: usize,
    /// Headers within this distance of the pivot have every seal verified.
    pub fs_header_force_verify: u64,
    /// Poll interval for new headers while the pivot state is being downloaded.
    #[serde(with = "humantime_serde")]
    pub fs_header_cont_check: Duration,
    /// Number of blocks at the head that are always executed in full during fast sync.
    pub fs_min_full_blocks: u64,
    /// Lower bound of the request round trip time estimate.
    #[serde(with = "humantime_serde")]
    pub rtt_min_estimate: Duration,
    /// Upper bound of the request round trip time estimate, used before any measurement.
    #[serde(with = "humantime_serde")]
    pub rtt_max_estimate: Duration,
    /// Multiplier applied to the round trip time to derive the request timeout.
    pub ttl_scaling: u32,
    /// Upper bound of any request timeout.
    #[serde(with = "humantime_serde")]
    pub ttl_limit: Duration,
    /// Number of best peers whose round trip times determine the timeout.
    pub qos_tuning_peers: usize,
    /// Weight of a new measurement in the throughput and round trip estimates.
    pub measurement_impact: f64,
    /// Number of hashes remembered per peer as not available from it.
    pub max_lacking_hashes: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_fork_ancestry: 90_000,
            block_cache_items: 8192,
            max_header_fetch: 192,
            max_skeleton_size: 128,
            max_block_fetch: 128,
            max_receipt_fetch: 256,
            max_state_fetch: 384,
            max_headers_process: 2048,
            max_results_process: 2048,
            max_queued_headers: 32 * 1024,
            fs_header_check_frequency: 100,
            fs_header_safety_net: 2048,
            fs_header_force_verify: 24,
            fs_header_cont_check: Duration::from_secs(3),
            fs_min_full_blocks: 64,
            rtt_min_estimate: Duration::from_secs(2),
            rtt_max_estimate: Duration::from_secs(20),
            ttl_scaling: 3,
            ttl_limit: Duration::from_secs(60),
            qos_tuning_peers: 5,
            measurement_impact: 0.1,
            max_lacking_hashes: 4096,
        }
    }
}

impl DownloaderConfig {
    /// Sets the fork ancestry bound.
    pub const fn with_max_fork_ancestry(mut self, max_fork_ancestry: u64) -> Self {
        self.max_fork_ancestry = max_fork_ancestry;
        self
    }

    /// Sets the result cache size.
    pub const fn with_block_cache_items(mut self, block_cache_items: usize) -> Self {
        self.block_cache_items = block_cache_items;
        self
    }

    /// Sets the header batch size.
    pub const fn with_max_header_fetch(mut self, max_header_fetch: u64) -> Self {
        self.max_header_fetch = max_header_fetch;
        self
    }

    /// Sets the number of blocks executed in full at the head of a fast sync.
    pub const fn with_fs_min_full_blocks(mut self, fs_min_full_blocks: u64) -> Self {
        self.fs_min_full_blocks = fs_min_full_blocks;
        self
    }

    /// Sets the fast sync rollback window.
    pub const fn with_fs_header_safety_net(mut self, fs_header_safety_net: usize) -> Self {
        self.fs_header_safety_net = fs_header_safety_net;
        self
    }
}
