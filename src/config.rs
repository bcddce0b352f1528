//! # Node Configuration
//!
//! Every tunable of the node lives here, grouped by component, each group
//! with production defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Routing table parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Active peers per bucket (Kademlia k).
    pub max_bucket_peers: usize,
    /// Candidate peers retained per full bucket.
    pub max_bucket_candidates: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_bucket_peers: 20,
            max_bucket_candidates: 20,
        }
    }
}

/// Search iterator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Parallel queries in flight.
    pub concurrency: usize,
    /// Responses from the closest peers needed to conclude a search.
    pub n_closest_responses: usize,
    /// Query errors tolerated before the iterator reports Errored.
    pub n_max_errors: usize,
    /// Deadline per outbound query.
    pub query_timeout: Duration,
    /// Deadline for the whole iteration.
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            n_closest_responses: 6,
            n_max_errors: 3,
            query_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Store iterator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Parallel store requests in flight.
    pub concurrency: usize,
    /// Successful replicas required for a Put to report Stored.
    pub n_replicas: usize,
    /// Store errors tolerated before the iterator reports Errored.
    pub n_max_errors: usize,
    /// Deadline per outbound store request.
    pub query_timeout: Duration,
    /// Deadline for the whole replication phase.
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            n_replicas: 3,
            n_max_errors: 3,
            query_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Introduce iterator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntroduceConfig {
    /// Distinct responding peers to discover before finishing.
    pub target_num_peers: usize,
    /// Peers requested from each introduced peer.
    pub num_peers_per_request: u32,
    /// Parallel introductions in flight.
    pub concurrency: usize,
    /// Query errors tolerated before the iterator reports Errored.
    pub n_max_errors: usize,
    /// Deadline per outbound introduction.
    pub query_timeout: Duration,
    /// Deadline for the whole iteration.
    pub timeout: Duration,
}

impl Default for IntroduceConfig {
    fn default() -> Self {
        Self {
            target_num_peers: 16,
            num_peers_per_request: 8,
            concurrency: 3,
            n_max_errors: 3,
            query_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Server-side subscription fan-out parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeFromConfig {
    /// Concurrent subscriber streams accepted.
    pub max_subscribers: usize,
    /// Pending publications buffered per subscriber before the oldest is
    /// dropped.
    pub send_slack: usize,
}

impl Default for SubscribeFromConfig {
    fn default() -> Self {
        Self {
            max_subscribers: 64,
            send_slack: 16,
        }
    }
}

/// Client-side subscription fan-in parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeToConfig {
    /// Remote subscriptions maintained concurrently.
    pub n_subscriptions: usize,
    /// Capacity of the recent-publications dedup cache.
    pub recent_cache_size: usize,
}

impl Default for SubscribeToConfig {
    fn default() -> Self {
        Self {
            n_subscriptions: 4,
            recent_cache_size: 1024,
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable node name, shared with peers.
    pub public_name: String,
    /// Address advertised to peers.
    pub public_addr: SocketAddr,
    /// Address the QUIC endpoint binds.
    pub local_addr: SocketAddr,
    /// Directory holding all node state.
    pub data_dir: PathBuf,
    pub routing: RoutingConfig,
    pub search: SearchConfig,
    pub store: StoreConfig,
    pub introduce: IntroduceConfig,
    pub subscribe_from: SubscribeFromConfig,
    pub subscribe_to: SubscribeToConfig,
}

impl Config {
    /// A loopback configuration rooted at `data_dir`, binding an
    /// OS-assigned port.
    pub fn local(data_dir: impl Into<PathBuf>) -> Self {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("valid loopback address");
        Self {
            public_name: "librarian".to_string(),
            public_addr: addr,
            local_addr: addr,
            data_dir: data_dir.into(),
            routing: RoutingConfig::default(),
            search: SearchConfig::default(),
            store: StoreConfig::default(),
            introduce: IntroduceConfig::default(),
            subscribe_from: SubscribeFromConfig::default(),
            subscribe_to: SubscribeToConfig::default(),
        }
    }

    /// Where the embedded database lives.
    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Where passphrase-encrypted key bundles live.
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_parameters() {
        let config = Config::local("/tmp/libri-test");
        assert_eq!(config.routing.max_bucket_peers, 20);
        assert_eq!(config.search.concurrency, 3);
        assert_eq!(config.search.query_timeout, Duration::from_secs(5));
        assert_eq!(config.search.timeout, Duration::from_secs(30));
        assert_eq!(config.store.n_replicas, 3);
        assert_eq!(config.subscribe_from.send_slack, 16);
        assert_eq!(config.subscribe_to.recent_cache_size, 1024);
    }

    #[test]
    fn directories_derive_from_data_dir() {
        let config = Config::local("/tmp/libri-test");
        assert_eq!(config.db_dir(), PathBuf::from("/tmp/libri-test/db"));
        assert_eq!(config.keys_dir(), PathBuf::from("/tmp/libri-test/keys"));
    }
}
