//! # Store Iterator
//!
//! A store is a search followed by replication. The search locates either
//! the value itself or the closest peers to the target key; if the value
//! already exists with identical bytes the store concludes with `Exists`,
//! otherwise workers issue parallel Store requests down the closest-peer
//! list until enough replicas acknowledge or errors accumulate past the
//! tolerance.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::id::Id;
use crate::peer::Peer;
use crate::search::{Search, SearchParams, Searcher};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Store parameters, derived from [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct StoreParams {
    pub concurrency: usize,
    pub n_replicas: usize,
    pub n_max_errors: usize,
    pub query_timeout: Duration,
    pub timeout: Duration,
}

impl From<&StoreConfig> for StoreParams {
    fn from(config: &StoreConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            n_replicas: config.n_replicas.max(1),
            n_max_errors: config.n_max_errors.max(1),
            query_timeout: config.query_timeout,
            timeout: config.timeout,
        }
    }
}

/// Shared mutable state of the replication phase.
pub struct StoreResult {
    unqueried: VecDeque<Peer>,
    pub responded: Vec<Peer>,
    pub errored: HashMap<Id, String>,
    pub fatal: Option<String>,
    /// The searched value already existed with identical bytes.
    pub exists: bool,
    in_flight: usize,
}

impl StoreResult {
    fn new() -> Self {
        Self {
            unqueried: VecDeque::new(),
            responded: Vec::new(),
            errored: HashMap::new(),
            fatal: None,
            exists: false,
            in_flight: 0,
        }
    }
}

/// One store operation: the embedded search plus replication state.
pub struct Store {
    pub key: Id,
    pub value: Vec<u8>,
    pub search: Arc<Search>,
    pub params: StoreParams,
    result: Mutex<StoreResult>,
}

impl Store {
    pub fn new(
        self_id: Id,
        key: Id,
        value: Vec<u8>,
        search_params: SearchParams,
        params: StoreParams,
    ) -> Self {
        Self {
            key,
            value,
            search: Arc::new(Search::new(self_id, key, search_params)),
            params,
            result: Mutex::new(StoreResult::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreResult> {
        self.result.lock().expect("store mutex poisoned")
    }

    /// Replication reached the target replica count.
    pub fn stored(&self) -> bool {
        self.lock().responded.len() >= self.params.n_replicas
    }

    /// The value was already present in the network.
    pub fn exists(&self) -> bool {
        self.lock().exists
    }

    pub fn errored(&self) -> bool {
        errored_locked(&self.lock(), self.params.n_max_errors) || self.search.errored()
    }

    pub fn exhausted(&self) -> bool {
        exhausted_locked(&self.lock())
    }

    pub fn finished(&self) -> bool {
        finished_locked(&self.lock(), &self.params)
    }

    /// Peers that acknowledged a replica.
    pub fn responded_peers(&self) -> Vec<Peer> {
        self.lock().responded.clone()
    }

    pub fn n_replicas(&self) -> usize {
        self.lock().responded.len()
    }
}

fn errored_locked(result: &StoreResult, n_max_errors: usize) -> bool {
    result.fatal.is_some() || result.errored.len() >= n_max_errors
}

fn exhausted_locked(result: &StoreResult) -> bool {
    result.unqueried.is_empty() && result.in_flight == 0
}

fn finished_locked(result: &StoreResult, params: &StoreParams) -> bool {
    result.exists
        || result.responded.len() >= params.n_replicas
        || errored_locked(result, params.n_max_errors)
        || exhausted_locked(result)
}

/// Issues Store requests on behalf of the replication workers.
#[async_trait]
pub trait StoreQuerier: Send + Sync {
    async fn store(&self, peer: &Peer, key: Id, value: Vec<u8>) -> Result<()>;
}

/// Runs store operations: search, then replication.
#[derive(Clone)]
pub struct Storer {
    searcher: Searcher,
    querier: Arc<dyn StoreQuerier>,
    stop: watch::Receiver<bool>,
}

impl Storer {
    pub fn new(
        searcher: Searcher,
        querier: Arc<dyn StoreQuerier>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            searcher,
            querier,
            stop,
        }
    }

    /// Run the store to completion from the given search seeds.
    pub async fn store(&self, store: &Arc<Store>, seeds: Vec<Peer>) -> Result<()> {
        self.searcher.search(&store.search, seeds).await?;

        if store.search.found_value() {
            let found = store.search.value().unwrap_or_default();
            let mut result = store.lock();
            if found == store.value {
                result.exists = true;
                return Ok(());
            }
            // Content addressing makes a different value under the same key
            // an integrity violation, not a race.
            result.fatal = Some("existing value under key differs".to_string());
            anyhow::bail!("store failed: existing value under key differs");
        }

        if !store.search.found_closest_peers() {
            // Errored or Exhausted propagates through the predicates.
            debug!(key = %store.key, "store search did not reach closest peers");
            return Ok(());
        }

        {
            let mut result = store.lock();
            result.unqueried = store.search.closest_peers().into();
        }

        let mut workers = JoinSet::new();
        for _ in 0..store.params.concurrency {
            let store = store.clone();
            let querier = self.querier.clone();
            workers.spawn(async move { work(store, querier).await });
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        let mut stop = self.stop.clone();
        tokio::select! {
            outcome = tokio::time::timeout(store.params.timeout, drain) => {
                if outcome.is_err() {
                    debug!(key = %store.key, "store replication timed out");
                }
            }
            _ = stop.changed() => {
                debug!(key = %store.key, "store interrupted by shutdown");
            }
        }

        let mut result = store.lock();
        result.in_flight = 0;
        if !finished_locked(&result, &store.params) {
            result.unqueried.clear();
        }
        if let Some(fatal) = &result.fatal {
            anyhow::bail!("store failed: {}", fatal);
        }
        Ok(())
    }
}

enum Step {
    Replicate(Peer),
    Wait,
    Done,
}

async fn work(store: Arc<Store>, querier: Arc<dyn StoreQuerier>) {
    loop {
        let step = {
            let mut result = store.lock();
            if finished_locked(&result, &store.params) {
                Step::Done
            } else if let Some(peer) = result.unqueried.pop_front() {
                result.in_flight += 1;
                Step::Replicate(peer)
            } else if result.in_flight > 0 {
                Step::Wait
            } else {
                Step::Done
            }
        };

        let peer = match step {
            Step::Done => break,
            Step::Wait => {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }
            Step::Replicate(peer) => peer,
        };

        let outcome = tokio::time::timeout(
            store.params.query_timeout,
            querier.store(&peer, store.key, store.value.clone()),
        )
        .await;

        let mut result = store.lock();
        result.in_flight -= 1;
        match outcome {
            Ok(Ok(())) => {
                trace!(peer = %peer.id, key = %store.key, "replica stored");
                result.responded.push(peer);
            }
            Ok(Err(e)) => {
                result.errored.insert(peer.id, e.to_string());
            }
            Err(_) => {
                result.errored.insert(peer.id, "store timeout".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::testing::{stopped_never, test_params, FixedNetwork};
    use crate::search::SearchQuerier;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStores {
        accepted: AtomicUsize,
        failing: HashSet<Id>,
    }

    impl CountingStores {
        fn new() -> Self {
            Self {
                accepted: AtomicUsize::new(0),
                failing: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl StoreQuerier for CountingStores {
        async fn store(&self, peer: &Peer, _key: Id, _value: Vec<u8>) -> Result<()> {
            if self.failing.contains(&peer.id) {
                anyhow::bail!("peer rejected store");
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn store_params() -> StoreParams {
        StoreParams {
            concurrency: 3,
            n_replicas: 3,
            n_max_errors: 3,
            query_timeout: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
        }
    }

    fn self_id() -> Id {
        Id::from_bytes([0xEE; 32])
    }

    fn make_store(key: Id, value: Vec<u8>) -> Arc<Store> {
        Arc::new(Store::new(
            self_id(),
            key,
            value,
            test_params(),
            store_params(),
        ))
    }

    #[tokio::test]
    async fn store_replicates_to_closest_peers() {
        let (network, peers) = FixedNetwork::fully_connected(8);
        let search_net: Arc<dyn SearchQuerier> = Arc::new(network);
        let stores = Arc::new(CountingStores::new());

        let storer = Storer::new(
            Searcher::new(search_net, stopped_never()),
            stores.clone(),
            stopped_never(),
        );
        let store = make_store(Id::from_bytes([0x55; 32]), b"value".to_vec());

        storer.store(&store, peers).await.unwrap();

        assert!(store.stored());
        assert!(!store.exists());
        assert_eq!(store.n_replicas(), 3);
        assert_eq!(stores.accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_of_existing_value_reports_exists() {
        let key = Id::from_bytes([0x55; 32]);
        let value = b"value".to_vec();
        let (mut network, peers) = FixedNetwork::fully_connected(8);
        network.values.insert(key, (peers[2].id, value.clone()));

        let stores = Arc::new(CountingStores::new());
        let storer = Storer::new(
            Searcher::new(Arc::new(network), stopped_never()),
            stores.clone(),
            stopped_never(),
        );
        let store = make_store(key, value);

        storer.store(&store, peers).await.unwrap();

        assert!(store.exists());
        assert!(!store.stored());
        assert_eq!(stores.accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatched_existing_value_is_fatal() {
        let key = Id::from_bytes([0x55; 32]);
        let (mut network, peers) = FixedNetwork::fully_connected(8);
        network.values.insert(key, (peers[2].id, b"other".to_vec()));

        let storer = Storer::new(
            Searcher::new(Arc::new(network), stopped_never()),
            Arc::new(CountingStores::new()),
            stopped_never(),
        );
        let store = make_store(key, b"value".to_vec());

        assert!(storer.store(&store, peers).await.is_err());
        assert!(store.errored());
    }

    #[tokio::test]
    async fn all_replicas_failing_reports_errored() {
        let (network, peers) = FixedNetwork::fully_connected(8);
        let mut stores = CountingStores::new();
        for peer in &peers {
            stores.failing.insert(peer.id);
        }

        let storer = Storer::new(
            Searcher::new(Arc::new(network), stopped_never()),
            Arc::new(stores),
            stopped_never(),
        );
        let store = make_store(Id::from_bytes([0x55; 32]), b"value".to_vec());

        storer.store(&store, peers).await.unwrap();

        assert!(store.errored());
        assert!(!store.stored());
        assert!(!store.exists());
    }

    #[tokio::test]
    async fn failed_search_propagates_without_replication() {
        let (mut network, peers) = FixedNetwork::fully_connected(5);
        for peer in &peers {
            network.failing.insert(peer.id);
        }
        let stores = Arc::new(CountingStores::new());
        let storer = Storer::new(
            Searcher::new(Arc::new(network), stopped_never()),
            stores.clone(),
            stopped_never(),
        );
        let store = make_store(Id::from_bytes([0x55; 32]), b"value".to_vec());

        storer.store(&store, peers).await.unwrap();

        assert!(store.errored());
        assert_eq!(stores.accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partial_failures_still_reach_replica_target() {
        let (network, peers) = FixedNetwork::fully_connected(8);
        let closest_probe = {
            // Find which peers a search would pick, then fail the nearest.
            let target = Id::from_bytes([0x55; 32]);
            let mut sorted = peers.clone();
            sorted.sort_by(|a, b| {
                crate::id::distance_cmp(&target.distance(&a.id), &target.distance(&b.id))
            });
            sorted[0].id
        };
        let mut stores = CountingStores::new();
        stores.failing.insert(closest_probe);

        let storer = Storer::new(
            Searcher::new(Arc::new(network), stopped_never()),
            Arc::new(stores),
            stopped_never(),
        );
        let store = make_store(Id::from_bytes([0x55; 32]), b"value".to_vec());

        storer.store(&store, peers).await.unwrap();

        assert!(store.stored());
        assert_eq!(store.n_replicas(), 3);
    }
}
