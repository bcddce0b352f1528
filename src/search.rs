//! # Search Iterator
//!
//! An iterative lookup that walks the network toward a target key with a
//! fixed-size worker pool. Workers repeatedly pop the unqueried peer
//! closest to the target, issue a Find query under a per-call deadline, and
//! merge the reply into a shared result guarded by one mutex.
//!
//! The search concludes when it finds the value, when the closest
//! `n_closest_responses` discovered peers have all responded
//! (`FoundClosestPeers`), when the candidate pool drains (`Exhausted`), or
//! when errors accumulate past the tolerance (`Errored`). On equal XOR
//! distance the lexicographically smaller peer ID is tried first, keeping
//! traversal deterministic for a given seed set.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::config::SearchConfig;
use crate::id::{distance_cmp, Id, ID_LENGTH};
use crate::peer::{Peer, PeerAddress};

/// Pause between polls while the candidate pool is empty but queries are
/// still in flight.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A peer tagged with its distance to the search target.
#[derive(Debug, Clone)]
pub(crate) struct DistancedPeer {
    pub distance: [u8; ID_LENGTH],
    pub peer: Peer,
}

impl DistancedPeer {
    pub fn new(peer: Peer, target: &Id) -> Self {
        Self {
            distance: target.distance(&peer.id),
            peer,
        }
    }
}

impl PartialEq for DistancedPeer {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.peer.id == other.peer.id
    }
}

impl Eq for DistancedPeer {}

impl PartialOrd for DistancedPeer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistancedPeer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        distance_cmp(&self.distance, &other.distance).then(self.peer.id.cmp(&other.peer.id))
    }
}

/// Bounded set of the closest responded peers, capped at
/// `n_closest_responses`.
#[derive(Debug)]
pub struct ClosestPeers {
    heap: BinaryHeap<DistancedPeer>,
    ids: HashSet<Id>,
    cap: usize,
}

impl ClosestPeers {
    fn new(cap: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            ids: HashSet::new(),
            cap,
        }
    }

    fn push(&mut self, peer: Peer, target: &Id) {
        if self.ids.contains(&peer.id) {
            return;
        }
        let entry = DistancedPeer::new(peer, target);
        if self.heap.len() < self.cap {
            self.ids.insert(entry.peer.id);
            self.heap.push(entry);
            return;
        }
        let farthest = self.heap.peek().expect("heap at cap is non-empty");
        if entry < *farthest {
            let removed = self.heap.pop().expect("heap at cap is non-empty");
            self.ids.remove(&removed.peer.id);
            self.ids.insert(entry.peer.id);
            self.heap.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn farthest_distance(&self) -> Option<[u8; ID_LENGTH]> {
        self.heap.peek().map(|e| e.distance)
    }

    /// Peers in ascending distance from the target.
    pub fn to_vec(&self) -> Vec<Peer> {
        let mut entries: Vec<DistancedPeer> = self.heap.iter().cloned().collect();
        entries.sort();
        entries.into_iter().map(|e| e.peer).collect()
    }
}

/// Shared mutable state of one search.
pub struct SearchResult {
    pub closest: ClosestPeers,
    unqueried: BinaryHeap<Reverse<DistancedPeer>>,
    seen: HashSet<Id>,
    pub responded: HashMap<Id, Peer>,
    pub errored: HashMap<Id, String>,
    pub value: Option<Vec<u8>>,
    pub fatal: Option<String>,
    in_flight: usize,
}

impl SearchResult {
    fn new(cap: usize) -> Self {
        Self {
            closest: ClosestPeers::new(cap),
            unqueried: BinaryHeap::new(),
            seen: HashSet::new(),
            responded: HashMap::new(),
            errored: HashMap::new(),
            value: None,
            fatal: None,
            in_flight: 0,
        }
    }

    fn add_unqueried(&mut self, peer: Peer, target: &Id) {
        if self.seen.insert(peer.id) {
            self.unqueried.push(Reverse(DistancedPeer::new(peer, target)));
        }
    }

    fn pop_unqueried(&mut self) -> Option<Peer> {
        self.unqueried.pop().map(|Reverse(entry)| entry.peer)
    }

    fn nearest_unqueried_distance(&self) -> Option<[u8; ID_LENGTH]> {
        self.unqueried.peek().map(|Reverse(entry)| entry.distance)
    }
}

/// Search parameters, derived from [`SearchConfig`].
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub concurrency: usize,
    pub n_closest_responses: usize,
    pub n_max_errors: usize,
    pub query_timeout: Duration,
    pub timeout: Duration,
}

impl From<&SearchConfig> for SearchParams {
    fn from(config: &SearchConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            n_closest_responses: config.n_closest_responses.max(1),
            n_max_errors: config.n_max_errors.max(1),
            query_timeout: config.query_timeout,
            timeout: config.timeout,
        }
    }
}

/// One iterative search for a target key.
pub struct Search {
    pub self_id: Id,
    pub target: Id,
    pub params: SearchParams,
    result: Mutex<SearchResult>,
}

impl Search {
    pub fn new(self_id: Id, target: Id, params: SearchParams) -> Self {
        let cap = params.n_closest_responses;
        Self {
            self_id,
            target,
            params,
            result: Mutex::new(SearchResult::new(cap)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SearchResult> {
        self.result.lock().expect("search mutex poisoned")
    }

    pub fn found_value(&self) -> bool {
        self.lock().value.is_some()
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.lock().value.clone()
    }

    pub fn found_closest_peers(&self) -> bool {
        found_closest_locked(&self.lock(), self.params.n_closest_responses)
    }

    pub fn errored(&self) -> bool {
        errored_locked(&self.lock(), self.params.n_max_errors)
    }

    pub fn exhausted(&self) -> bool {
        exhausted_locked(&self.lock())
    }

    pub fn finished(&self) -> bool {
        finished_locked(&self.lock(), &self.params)
    }

    /// The closest responded peers, ascending by distance.
    pub fn closest_peers(&self) -> Vec<Peer> {
        self.lock().closest.to_vec()
    }

    pub fn responded_peers(&self) -> Vec<Peer> {
        self.lock().responded.values().cloned().collect()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.lock().fatal.clone()
    }
}

fn found_closest_locked(result: &SearchResult, n_closest_responses: usize) -> bool {
    if result.value.is_some() || result.closest.is_empty() {
        return false;
    }
    let drained = result.unqueried.is_empty() && result.in_flight == 0;
    if result.closest.len() < n_closest_responses && !drained {
        return false;
    }
    match (
        result.closest.farthest_distance(),
        result.nearest_unqueried_distance(),
    ) {
        (Some(farthest), Some(nearest)) => {
            distance_cmp(&farthest, &nearest) != std::cmp::Ordering::Greater
        }
        _ => true,
    }
}

fn errored_locked(result: &SearchResult, n_max_errors: usize) -> bool {
    result.fatal.is_some() || result.errored.len() >= n_max_errors
}

fn exhausted_locked(result: &SearchResult) -> bool {
    result.unqueried.is_empty() && result.in_flight == 0
}

fn finished_locked(result: &SearchResult, params: &SearchParams) -> bool {
    result.value.is_some()
        || found_closest_locked(result, params.n_closest_responses)
        || errored_locked(result, params.n_max_errors)
        || exhausted_locked(result)
}

/// Reply to one Find query.
#[derive(Debug, Clone)]
pub struct FindReply {
    pub value: Option<Vec<u8>>,
    pub peers: Vec<PeerAddress>,
}

/// Issues Find queries on behalf of the search workers.
#[async_trait]
pub trait SearchQuerier: Send + Sync {
    async fn find(&self, peer: &Peer, target: Id, num_peers: u32) -> Result<FindReply>;
}

/// Runs searches with a bounded worker pool.
#[derive(Clone)]
pub struct Searcher {
    querier: Arc<dyn SearchQuerier>,
    stop: watch::Receiver<bool>,
}

impl Searcher {
    pub fn new(querier: Arc<dyn SearchQuerier>, stop: watch::Receiver<bool>) -> Self {
        Self { querier, stop }
    }

    /// Run the search to completion from the given seeds.
    pub async fn search(&self, search: &Arc<Search>, seeds: Vec<Peer>) -> Result<()> {
        {
            let mut result = search.lock();
            for seed in seeds {
                if seed.id != search.self_id {
                    result.add_unqueried(seed, &search.target);
                }
            }
        }

        let mut workers = JoinSet::new();
        for _ in 0..search.params.concurrency {
            let search = search.clone();
            let querier = self.querier.clone();
            workers.spawn(async move { work(search, querier).await });
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        let mut stop = self.stop.clone();
        tokio::select! {
            outcome = tokio::time::timeout(search.params.timeout, drain) => {
                if outcome.is_err() {
                    debug!(key = %search.target, "search timed out");
                }
            }
            _ = stop.changed() => {
                debug!(key = %search.target, "search interrupted by shutdown");
            }
        }

        let mut result = search.lock();
        result.in_flight = 0;
        if !finished_locked(&result, &search.params) {
            result.unqueried.clear();
        }
        if let Some(fatal) = &result.fatal {
            anyhow::bail!("search failed: {}", fatal);
        }
        Ok(())
    }
}

enum Step {
    Query(Peer),
    Wait,
    Done,
}

async fn work(search: Arc<Search>, querier: Arc<dyn SearchQuerier>) {
    let num_peers = search.params.n_closest_responses as u32;
    loop {
        let step = {
            let mut result = search.lock();
            if finished_locked(&result, &search.params) {
                Step::Done
            } else if let Some(peer) = result.pop_unqueried() {
                result.in_flight += 1;
                Step::Query(peer)
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
            Step::Query(peer) => peer,
        };

        let outcome = tokio::time::timeout(
            search.params.query_timeout,
            querier.find(&peer, search.target, num_peers),
        )
        .await;

        let mut result = search.lock();
        result.in_flight -= 1;
        match outcome {
            Ok(Ok(reply)) => {
                trace!(
                    peer = %peer.id,
                    found_value = reply.value.is_some(),
                    n_peers = reply.peers.len(),
                    "search query succeeded"
                );
                process_reply(&mut result, &search, peer, reply);
            }
            Ok(Err(e)) => {
                result.errored.insert(peer.id, e.to_string());
            }
            Err(_) => {
                result.errored.insert(peer.id, "query timeout".to_string());
            }
        }
    }
}

fn process_reply(result: &mut SearchResult, search: &Search, from: Peer, reply: FindReply) {
    result.seen.insert(from.id);
    result.responded.insert(from.id, from.clone());
    if let Some(value) = reply.value {
        result.value = Some(value);
        return;
    }
    result.closest.push(from, &search.target);
    for address in reply.peers {
        if address.peer_id == search.self_id {
            continue;
        }
        result.add_unqueried(Peer::from_address(&address), &search.target);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// A fixed in-memory network: each peer knows some others, and at most
    /// one holds the value.
    pub(crate) struct FixedNetwork {
        pub peers: HashMap<Id, Vec<PeerAddress>>,
        pub values: HashMap<Id, (Id, Vec<u8>)>,
        pub failing: HashSet<Id>,
    }

    impl FixedNetwork {
        /// A fully-connected network of `n` deterministic peers.
        pub fn fully_connected(n: u8) -> (Self, Vec<Peer>) {
            let addresses: Vec<PeerAddress> = (0..n)
                .map(|i| PeerAddress {
                    peer_id: Id::from_bytes([i + 1; 32]),
                    name: format!("peer-{}", i),
                    address: format!("127.0.0.1:{}", 21000 + i as u16).parse().unwrap(),
                })
                .collect();
            let peers = addresses.iter().map(Peer::from_address).collect();
            let network = Self {
                peers: addresses
                    .iter()
                    .map(|a| (a.peer_id, addresses.clone()))
                    .collect(),
                values: HashMap::new(),
                failing: HashSet::new(),
            };
            (network, peers)
        }
    }

    #[async_trait]
    impl SearchQuerier for FixedNetwork {
        async fn find(&self, peer: &Peer, target: Id, _num_peers: u32) -> Result<FindReply> {
            if self.failing.contains(&peer.id) {
                anyhow::bail!("peer unreachable");
            }
            if let Some((holder, value)) = self.values.get(&target) {
                if *holder == peer.id {
                    return Ok(FindReply {
                        value: Some(value.clone()),
                        peers: vec![],
                    });
                }
            }
            Ok(FindReply {
                value: None,
                peers: self.peers.get(&peer.id).cloned().unwrap_or_default(),
            })
        }
    }

    pub(crate) fn test_params() -> SearchParams {
        SearchParams {
            concurrency: 3,
            n_closest_responses: 4,
            n_max_errors: 3,
            query_timeout: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
        }
    }

    pub(crate) fn stopped_never() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test process.
        std::mem::forget(tx);
        rx
    }
}
