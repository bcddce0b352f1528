//! # Routing Table
//!
//! A bucketed Kademlia table keyed by XOR distance to the node's own ID.
//! Buckets carry explicit inclusive ID intervals that always partition the
//! full 256-bit space. Each bucket holds up to k active peers ordered by
//! recency (most-recently-responded last) plus a bounded FIFO of candidate
//! peers it has heard about but not admitted.
//!
//! Pushing into a full bucket whose interval contains the self ID splits
//! the bucket at its midpoint and retries; pushing into any other full
//! bucket demotes the newcomer to its candidate list.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RoutingConfig;
use crate::id::{distance_cmp, Id};
use crate::peer::{Peer, QueryDirection, QueryOutcome};
use crate::storage::{ServerStore, StorageError};

/// Server-namespace key under which the table is persisted.
pub const ROUTING_TABLE_KEY: &[u8] = b"routing_table";

/// Where a pushed peer ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Admitted as a new active peer.
    Added,
    /// Already active; refreshed to most-recent position.
    Updated,
    /// Bucket full and not splittable for this peer; kept as a candidate.
    Candidate,
}

#[derive(Debug)]
struct Bucket {
    lower: Id,
    upper: Id,
    active: VecDeque<Peer>,
    candidates: VecDeque<Peer>,
}

impl Bucket {
    fn new(lower: Id, upper: Id) -> Self {
        Self {
            lower,
            upper,
            active: VecDeque::new(),
            candidates: VecDeque::new(),
        }
    }

    #[inline]
    fn contains(&self, id: &Id) -> bool {
        self.lower <= *id && *id <= self.upper
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.active.iter().position(|p| p.id == *id)
    }
}

/// The routing table.
pub struct RoutingTable {
    self_id: Id,
    config: RoutingConfig,
    /// Sorted by `lower`; intervals partition `[ZERO, MAX]`.
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: Id, config: RoutingConfig) -> Self {
        Self {
            self_id,
            config,
            buckets: vec![Bucket::new(Id::ZERO, Id::MAX)],
        }
    }

    pub fn self_id(&self) -> Id {
        self.self_id
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_peers(&self) -> usize {
        self.buckets.iter().map(|b| b.active.len()).sum()
    }

    fn bucket_index(&self, id: &Id) -> usize {
        let idx = self.buckets.partition_point(|b| b.lower <= *id);
        debug_assert!(idx > 0, "intervals must cover the full ID space");
        idx - 1
    }

    /// Place a peer. Self is never admitted; known peers refresh to the
    /// most-recently-responded position.
    pub fn push(&mut self, peer: Peer) -> PushOutcome {
        if peer.id == self.self_id {
            return PushOutcome::Updated;
        }
        loop {
            let idx = self.bucket_index(&peer.id);
            let max_peers = self.config.max_bucket_peers;
            let contains_self = self.buckets[idx].contains(&self.self_id);
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.position(&peer.id) {
                let mut existing = bucket.active.remove(pos).expect("position is in range");
                existing.name = peer.name;
                existing.address = peer.address;
                bucket.active.push_back(existing);
                return PushOutcome::Updated;
            }

            if bucket.active.len() < max_peers {
                bucket.candidates.retain(|c| c.id != peer.id);
                bucket.active.push_back(peer);
                return PushOutcome::Added;
            }

            if contains_self && bucket.lower < bucket.upper {
                self.split(idx);
                continue;
            }

            if bucket.candidates.iter().all(|c| c.id != peer.id) {
                bucket.candidates.push_back(peer);
                while bucket.candidates.len() > self.config.max_bucket_candidates {
                    bucket.candidates.pop_front();
                }
            }
            return PushOutcome::Candidate;
        }
    }

    fn split(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let mid = Id::midpoint(&bucket.lower, &bucket.upper);
        let mut left = Bucket::new(bucket.lower, mid);
        let mut right = Bucket::new(mid.successor(), bucket.upper);
        assert!(
            left.upper < right.lower,
            "bucket split produced overlapping ranges"
        );

        for peer in bucket.active {
            if left.contains(&peer.id) {
                left.active.push_back(peer);
            } else {
                right.active.push_back(peer);
            }
        }
        for peer in bucket.candidates {
            if left.contains(&peer.id) {
                left.candidates.push_back(peer);
            } else {
                right.candidates.push_back(peer);
            }
        }

        debug!(
            lower = %left.lower,
            mid = %left.upper,
            upper = %right.upper,
            left_peers = left.active.len(),
            right_peers = right.active.len(),
            "split routing bucket"
        );
        self.buckets.insert(idx, right);
        self.buckets.insert(idx, left);
    }

    /// Up to `n` distinct peers in ascending XOR distance from `key`,
    /// ties broken by ascending peer ID.
    pub fn peak(&self, key: &Id, n: usize) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.active.iter().cloned())
            .collect();
        peers.sort_by(|a, b| {
            distance_cmp(&key.distance(&a.id), &key.distance(&b.id)).then(a.id.cmp(&b.id))
        });
        peers.truncate(n);
        peers
    }

    /// Reservoir-sample up to `n` active peers.
    pub fn sample<R: rand::Rng>(&self, n: usize, rng: &mut R) -> Vec<Peer> {
        if n == 0 {
            return Vec::new();
        }
        let mut reservoir: Vec<Peer> = Vec::with_capacity(n);
        let mut seen = 0usize;
        for peer in self.buckets.iter().flat_map(|b| b.active.iter()) {
            if reservoir.len() < n {
                reservoir.push(peer.clone());
            } else {
                let j = rng.gen_range(0..=seen);
                if j < n {
                    reservoir[j] = peer.clone();
                }
            }
            seen += 1;
        }
        reservoir
    }

    pub fn get(&self, id: &Id) -> Option<&Peer> {
        let idx = self.bucket_index(id);
        self.buckets[idx].active.iter().find(|p| p.id == *id)
    }

    /// Record a query outcome for a known peer. A successful response also
    /// refreshes the peer to the most-recently-responded position.
    pub fn record(&mut self, id: &Id, direction: QueryDirection, outcome: QueryOutcome) -> bool {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        bucket.active[pos].record(direction, outcome);
        if direction == QueryDirection::Response && outcome == QueryOutcome::Success {
            let peer = bucket.active.remove(pos).expect("position is in range");
            bucket.active.push_back(peer);
        }
        true
    }

    /// Persist all active peers to the server namespace.
    pub fn save(&self, store: &ServerStore) -> Result<(), StorageError> {
        let saved = SavedTable {
            self_id: self.self_id,
            peers: self
                .buckets
                .iter()
                .flat_map(|b| b.active.iter().cloned())
                .collect(),
        };
        let bytes = bincode::serialize(&saved)
            .map_err(|e| StorageError::Db(e.to_string()))?;
        store.store(ROUTING_TABLE_KEY, &bytes)
    }

    /// Rebuild a previously saved table; bucket intervals are reconstructed
    /// by replaying pushes against the self ID.
    pub fn load(
        store: &ServerStore,
        self_id: Id,
        config: RoutingConfig,
    ) -> Result<Option<Self>, StorageError> {
        let Some(bytes) = store.load(ROUTING_TABLE_KEY)? else {
            return Ok(None);
        };
        let saved: SavedTable =
            bincode::deserialize(&bytes).map_err(|e| StorageError::Db(e.to_string()))?;
        let mut table = Self::new(self_id, config);
        for peer in saved.peers {
            table.push(peer);
        }
        Ok(Some(table))
    }

    #[cfg(test)]
    fn check_partition(&self) {
        assert_eq!(self.buckets[0].lower, Id::ZERO);
        assert_eq!(
            self.buckets.last().expect("at least one bucket").upper,
            Id::MAX
        );
        for pair in self.buckets.windows(2) {
            assert!(pair[0].upper < pair[1].lower, "buckets overlap");
            assert_eq!(
                pair[0].upper.successor(),
                pair[1].lower,
                "gap between buckets"
            );
        }
        for bucket in &self.buckets {
            for peer in &bucket.active {
                assert!(bucket.contains(&peer.id), "peer outside its bucket");
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SavedTable {
    self_id: Id,
    peers: Vec<Peer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::MemKvdb;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(7)
    }

    fn peer_with_id(id: Id) -> Peer {
        Peer::new(id, "test", "127.0.0.1:20000".parse().unwrap())
    }

    fn random_peer<R: rand::Rng>(rng: &mut R) -> Peer {
        peer_with_id(Id::random(rng))
    }

    fn small_config() -> RoutingConfig {
        RoutingConfig {
            max_bucket_peers: 4,
            max_bucket_candidates: 4,
        }
    }

    #[test]
    fn push_into_empty_table() {
        let mut rng = rng();
        let mut table = RoutingTable::new(Id::random(&mut rng), RoutingConfig::default());
        let peer = random_peer(&mut rng);
        assert_eq!(table.push(peer.clone()), PushOutcome::Added);
        assert_eq!(table.num_peers(), 1);
        assert_eq!(table.get(&peer.id).map(|p| p.id), Some(peer.id));
    }

    #[test]
    fn push_existing_peer_updates() {
        let mut rng = rng();
        let mut table = RoutingTable::new(Id::random(&mut rng), RoutingConfig::default());
        let peer = random_peer(&mut rng);
        table.push(peer.clone());

        let mut renamed = peer.clone();
        renamed.name = "renamed".to_string();
        assert_eq!(table.push(renamed), PushOutcome::Updated);
        assert_eq!(table.num_peers(), 1);
        assert_eq!(table.get(&peer.id).unwrap().name, "renamed");
    }

    #[test]
    fn self_id_is_never_admitted() {
        let mut rng = rng();
        let self_id = Id::random(&mut rng);
        let mut table = RoutingTable::new(self_id, RoutingConfig::default());
        table.push(peer_with_id(self_id));
        assert_eq!(table.num_peers(), 0);
    }

    #[test]
    fn partition_invariant_holds_under_pushes() {
        let mut rng = rng();
        let self_id = Id::random(&mut rng);
        let mut table = RoutingTable::new(self_id, small_config());
        for _ in 0..500 {
            table.push(random_peer(&mut rng));
            table.check_partition();
        }
        assert!(table.num_buckets() > 1, "expected at least one split");
    }

    #[test]
    fn full_non_self_bucket_demotes_to_candidates() {
        let mut rng = rng();
        // Self at the very bottom of the space; peers in the top half land
        // in a non-self bucket after the first split.
        let self_id = Id::ZERO;
        let mut table = RoutingTable::new(self_id, small_config());

        let mut outcomes = Vec::new();
        for _ in 0..200 {
            let mut bytes = *Id::random(&mut rng).as_bytes();
            bytes[0] |= 0x80;
            outcomes.push(table.push(peer_with_id(Id::from_bytes(bytes))));
        }
        assert!(
            outcomes.contains(&PushOutcome::Candidate),
            "expected demotions once the far bucket filled"
        );
        table.check_partition();
    }

    #[test]
    fn candidate_list_is_bounded_fifo() {
        let mut rng = rng();
        let config = small_config();
        let mut table = RoutingTable::new(Id::ZERO, config.clone());
        for _ in 0..200 {
            let mut bytes = *Id::random(&mut rng).as_bytes();
            bytes[0] |= 0x80;
            table.push(peer_with_id(Id::from_bytes(bytes)));
        }
        for bucket in &table.buckets {
            assert!(bucket.candidates.len() <= config.max_bucket_candidates);
        }
    }

    #[test]
    fn peak_orders_by_distance() {
        let mut rng = rng();
        let mut table = RoutingTable::new(Id::random(&mut rng), RoutingConfig::default());
        for _ in 0..100 {
            table.push(random_peer(&mut rng));
        }

        for _ in 0..20 {
            let key = Id::random(&mut rng);
            let peers = table.peak(&key, 10);
            assert!(!peers.is_empty());
            for pair in peers.windows(2) {
                let d0 = key.distance(&pair[0].id);
                let d1 = key.distance(&pair[1].id);
                assert_ne!(
                    distance_cmp(&d0, &d1),
                    std::cmp::Ordering::Greater,
                    "peak must be non-decreasing in distance"
                );
            }
        }
    }

    #[test]
    fn peak_returns_all_when_n_exceeds_table() {
        let mut rng = rng();
        let mut table = RoutingTable::new(Id::random(&mut rng), RoutingConfig::default());
        for _ in 0..5 {
            table.push(random_peer(&mut rng));
        }
        assert_eq!(table.peak(&Id::ZERO, 100).len(), 5);
    }

    #[test]
    fn sample_is_deterministic_for_a_seed() {
        let mut rng = rng();
        let mut table = RoutingTable::new(Id::random(&mut rng), RoutingConfig::default());
        for _ in 0..50 {
            table.push(random_peer(&mut rng));
        }

        let mut rng_a = rand::rngs::StdRng::seed_from_u64(42);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(42);
        let sample_a: Vec<Id> = table.sample(8, &mut rng_a).iter().map(|p| p.id).collect();
        let sample_b: Vec<Id> = table.sample(8, &mut rng_b).iter().map(|p| p.id).collect();
        assert_eq!(sample_a, sample_b);
        assert_eq!(sample_a.len(), 8);

        let distinct: std::collections::HashSet<Id> = sample_a.into_iter().collect();
        assert_eq!(distinct.len(), 8, "sampled peers must be distinct");
    }

    #[test]
    fn record_response_success_refreshes_recency() {
        let mut rng = rng();
        let self_id = Id::random(&mut rng);
        let mut table = RoutingTable::new(self_id, RoutingConfig::default());
        let first = random_peer(&mut rng);
        let second = random_peer(&mut rng);
        table.push(first.clone());
        table.push(second.clone());

        assert!(table.record(
            &first.id,
            QueryDirection::Response,
            QueryOutcome::Success
        ));
        let idx = table.bucket_index(&first.id);
        assert_eq!(
            table.buckets[idx].active.back().map(|p| p.id),
            Some(first.id)
        );
        assert_eq!(table.get(&first.id).unwrap().outcomes.responses.n_queries, 1);

        assert!(!table.record(
            &Id::random(&mut rng),
            QueryDirection::Request,
            QueryOutcome::Success
        ));
    }

    #[test]
    fn save_load_roundtrip() {
        let mut rng = rng();
        let self_id = Id::random(&mut rng);
        let store = ServerStore::new(Arc::new(MemKvdb::default()));
        let mut table = RoutingTable::new(self_id, small_config());
        for _ in 0..50 {
            table.push(random_peer(&mut rng));
        }
        table.save(&store).unwrap();

        let loaded = RoutingTable::load(&store, self_id, small_config())
            .unwrap()
            .expect("saved table should load");
        assert_eq!(loaded.num_peers(), table.num_peers());
        loaded.check_partition();

        // Every saved peer is present in the reloaded table.
        for bucket in &table.buckets {
            for peer in &bucket.active {
                assert!(loaded.get(&peer.id).is_some());
            }
        }
    }

    #[test]
    fn load_missing_returns_none() {
        let store = ServerStore::new(Arc::new(MemKvdb::default()));
        assert!(RoutingTable::load(&store, Id::ZERO, RoutingConfig::default())
            .unwrap()
            .is_none());
    }
}
