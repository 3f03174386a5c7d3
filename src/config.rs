use std::time::Duration;

/// Tunable intervals and bounds for a DHT node.
///
/// Defaults match the values the network was measured against; most
/// embedders only ever touch `read_timeout`.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long one run-loop iteration may block waiting for a datagram.
    pub read_timeout: Duration,
    /// Quick timeout for search-type transactions; expiry stalls them.
    pub quick_timeout_secs: u64,
    /// Hard timeout after which any transaction fails.
    pub hard_timeout_secs: u64,
    /// Interval of the transaction timeout sweep.
    pub sweep_interval_secs: u64,
    /// Interval of steady-state table maintenance and token rotation.
    pub refresh_interval_secs: u64,
    /// Retry interval while bootstrapping.
    pub bootstrap_retry_secs: u64,
    /// Known-node count at which bootstrap is considered done.
    pub bootstrap_target: usize,
    /// Bootstrap contacts pinged per round.
    pub bootstrap_burst: usize,
    /// A bucket unchanged for this long gets a refresh lookup.
    pub bucket_stale_secs: u64,
    /// Announced peers older than this are pruned.
    pub peer_max_age_secs: u64,
    /// Bound of the fallback contact FIFO.
    pub max_contacts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            read_timeout: Duration::from_millis(10),
            quick_timeout_secs: 4,
            hard_timeout_secs: 30,
            sweep_interval_secs: 3,
            refresh_interval_secs: 15 * 60,
            bootstrap_retry_secs: 60,
            bootstrap_target: 32,
            bootstrap_burst: 8,
            bucket_stale_secs: 15 * 60,
            peer_max_age_secs: 30 * 60,
            max_contacts: 64,
        }
    }
}
