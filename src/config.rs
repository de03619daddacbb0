use std::time::Duration;

/// Tunables shared by the coordinator, the shard replicas and the router.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Target number of replicas per shard.
    pub replication_factor: usize,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
    /// Base follower election timeout; each replica adds seeded jitter.
    pub election_timeout: Duration,
    /// Per-RPC deadline on the client side.
    pub request_deadline: Duration,
    /// How many leader-hint redirections a client follows before giving up.
    pub max_redirects: usize,
    /// Size of one HLC batch reserved through the coordinator log.
    pub hlc_batch_size: u64,
    /// Remaining-margin threshold that triggers reserving the next batch.
    pub hlc_refill_margin: u64,
    /// Default page size for vertex scans.
    pub scan_batch_limit: usize,
    /// Whether edges carry properties (and therefore edge records).
    pub properties_on_edges: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            heartbeat_interval: Duration::from_millis(25),
            election_timeout: Duration::from_millis(150),
            request_deadline: Duration::from_millis(2_000),
            max_redirects: 8,
            hlc_batch_size: 1_000,
            hlc_refill_margin: 100,
            scan_batch_limit: 1_024,
            properties_on_edges: true,
        }
    }
}

impl ClusterConfig {
    /// Settings for multi-replica deployments.
    pub fn replicated(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            ..Self::default()
        }
    }

    /// Tight timeouts for in-process test clusters.
    pub fn testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout: Duration::from_millis(50),
            request_deadline: Duration::from_millis(1_000),
            hlc_batch_size: 64,
            hlc_refill_margin: 8,
            scan_batch_limit: 8,
            ..Self::default()
        }
    }
}
