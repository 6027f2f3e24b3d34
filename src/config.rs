use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the log and the lock file.
    pub dir: PathBuf,

    /// Delta-chain length above which a page is compacted (default: 32)
    pub max_delta_chain_len: u16,

    /// Item count above which a page is split (default: 300)
    pub max_page_items: u16,

    /// Item count below which a page is merged into its left neighbor
    /// (default: 8)
    pub min_page_items: u16,

    /// Maximum deltas marshaled into a single log block; longer chains
    /// flush as multiple linked blocks (default: 16)
    pub max_page_lss_segments: u16,

    /// A max-SN checkpoint block is written every this many snapshots
    /// (default: 360)
    pub max_sn_sync_frequency: u64,

    /// Keys longer than this are rejected with KeyTooLarge (default: 4096)
    pub max_key_size: usize,

    /// Worker threads for persist/evict sweeps and rollback (default: 4)
    pub num_persistor_threads: usize,

    /// Interval for the background persist task, when scheduled
    /// (default: 10s)
    pub auto_persist_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            max_delta_chain_len: 32,
            max_page_items: 300,
            min_page_items: 8,
            max_page_lss_segments: 16,
            max_sn_sync_frequency: 360,
            max_key_size: 4096,
            num_persistor_threads: 4,
            auto_persist_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the compaction threshold (delta-chain length)
    pub fn max_delta_chain_len(mut self, len: u16) -> Self {
        self.max_delta_chain_len = len;
        self
    }

    /// Set the split threshold (items per page)
    pub fn max_page_items(mut self, n: u16) -> Self {
        self.max_page_items = n;
        self
    }

    /// Set the merge threshold (items per page)
    pub fn min_page_items(mut self, n: u16) -> Self {
        self.min_page_items = n;
        self
    }

    /// Set the per-block delta cap for segmented flushes
    pub fn max_page_lss_segments(mut self, n: u16) -> Self {
        self.max_page_lss_segments = n;
        self
    }

    /// Set the max-SN checkpoint frequency
    pub fn max_sn_sync_frequency(mut self, freq: u64) -> Self {
        self.max_sn_sync_frequency = freq;
        self
    }

    /// Set the maximum accepted key size
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    /// Set the persist/evict worker thread count
    pub fn num_persistor_threads(mut self, n: usize) -> Self {
        self.num_persistor_threads = n.max(1);
        self
    }

    /// Set the background persist interval
    pub fn auto_persist_interval(mut self, interval: Duration) -> Self {
        self.auto_persist_interval = interval;
        self
    }
}
