//! # Publication Pub/Sub
//!
//! Two mirror-image halves move publications through the overlay:
//!
//! - [`SubscribeFrom`] fans publications arriving on the node's single
//!   `new_pubs` channel out to every open subscriber stream. Fan-out rides
//!   a broadcast channel with bounded slack, so a slow subscriber loses its
//!   oldest pending publications rather than stalling the rest; delivery is
//!   best-effort.
//! - [`SubscribeTo`] maintains subscription streams to a few randomly
//!   sampled peers, deduplicates what arrives against the shared
//!   [`RecentPublications`] cache, and forwards fresh publications into
//!   `new_pubs` with a non-blocking send (drop and count on overflow).
//!   Failed streams retry with jittered exponential backoff.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use growable_bloom_filter::GrowableBloom;
use lru::LruCache;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::LibrarianClient;
use crate::config::{SubscribeFromConfig, SubscribeToConfig};
use crate::documents::{KeyedPublication, Publication};
use crate::id::Id;
use crate::messages::Subscription;
use crate::routing::RoutingTable;

/// Base delay between subscription retry attempts.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap on the subscription retry delay.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Jitter applied to every backoff wait, as a fraction of the delay.
const BACKOFF_JITTER: f64 = 0.2;

/// Capacity of the `new_pubs` channel between producers and the fan-out.
pub const NEW_PUBLICATIONS_SLACK: usize = 16;

/// Subscription admission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// The subscriber cap is reached.
    NotAcceptingNewSubscriptions,
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscribeError::NotAcceptingNewSubscriptions => {
                write!(f, "not accepting new subscriptions")
            }
        }
    }
}

impl std::error::Error for SubscribeError {}

/// Bounded LRU of recently seen publications, shared by everything that
/// deduplicates.
pub struct RecentPublications {
    cache: Mutex<LruCache<Id, Publication>>,
}

impl RecentPublications {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero"),
            )),
        }
    }

    /// Record a publication; returns true if it was already present.
    pub fn seen_or_add(&self, keyed: &KeyedPublication) -> bool {
        self.cache
            .lock()
            .expect("recent publications mutex poisoned")
            .put(keyed.key, keyed.value.clone())
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .expect("recent publications mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a bloom filter over a set of public keys at the given
/// false-positive rate.
pub fn filter_from_keys(keys: &[Vec<u8>], fp_rate: f64) -> GrowableBloom {
    let mut filter = GrowableBloom::new(fp_rate.clamp(1e-9, 0.999), keys.len().max(1));
    for key in keys {
        filter.insert(key.as_slice());
    }
    filter
}

/// Build a subscription from optional author/reader key sets; `None` means
/// match-everything on that axis.
pub fn subscription_for(
    author_keys: Option<&[Vec<u8>]>,
    reader_keys: Option<&[Vec<u8>]>,
    fp_rate: f64,
) -> Subscription {
    Subscription {
        author_filter: author_keys.map(|keys| filter_from_keys(keys, fp_rate)),
        reader_filter: reader_keys.map(|keys| filter_from_keys(keys, fp_rate)),
    }
}

/// Server-side fan-out of publications to subscriber streams.
pub struct SubscribeFrom {
    fanout_tx: broadcast::Sender<KeyedPublication>,
    max_subscribers: usize,
}

impl SubscribeFrom {
    /// Start the fan-out loop consuming `new_pubs`.
    pub fn new(
        config: &SubscribeFromConfig,
        mut new_pubs: mpsc::Receiver<KeyedPublication>,
    ) -> Arc<Self> {
        let (fanout_tx, _) = broadcast::channel(config.send_slack.max(1));
        let from = Arc::new(Self {
            fanout_tx: fanout_tx.clone(),
            max_subscribers: config.max_subscribers,
        });
        tokio::spawn(async move {
            while let Some(keyed) = new_pubs.recv().await {
                trace!(key = %keyed.key, "fanning out publication");
                // No receivers just means nobody is subscribed right now.
                let _ = fanout_tx.send(keyed);
            }
            debug!("publication fan-out stopped");
        });
        from
    }

    /// Open a subscriber channel, if capacity allows.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<KeyedPublication>, SubscribeError> {
        if self.fanout_tx.receiver_count() >= self.max_subscribers {
            return Err(SubscribeError::NotAcceptingNewSubscriptions);
        }
        Ok(self.fanout_tx.subscribe())
    }

    pub fn num_subscribers(&self) -> usize {
        self.fanout_tx.receiver_count()
    }
}

/// Client-side fan-in from remote subscription streams.
pub struct SubscribeTo {
    config: SubscribeToConfig,
    recent: Arc<RecentPublications>,
    new_pubs_tx: mpsc::Sender<KeyedPublication>,
    dropped: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscribeTo {
    pub fn new(
        config: SubscribeToConfig,
        recent: Arc<RecentPublications>,
        new_pubs_tx: mpsc::Sender<KeyedPublication>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            recent,
            new_pubs_tx,
            dropped: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Forward a publication into the fan-out unless it was seen recently.
    /// The send never blocks; on overflow the publication is dropped and
    /// counted.
    pub fn send(&self, keyed: KeyedPublication) {
        if self.recent.seen_or_add(&keyed) {
            trace!(key = %keyed.key, "publication already seen");
            return;
        }
        match self.new_pubs_tx.try_send(keyed) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(keyed)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %keyed.key, "new publications channel full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Publications dropped because `new_pubs` was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Begin maintaining subscriptions to randomly sampled peers.
    pub fn begin(
        self: &Arc<Self>,
        client: Arc<LibrarianClient>,
        routing: Arc<Mutex<RoutingTable>>,
        stop: watch::Receiver<bool>,
    ) {
        let mut tasks = self.tasks.lock().expect("subscribe-to mutex poisoned");
        for index in 0..self.config.n_subscriptions {
            let this = self.clone();
            let client = client.clone();
            let routing = routing.clone();
            let stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                this.maintain(index, client, routing, stop).await;
            }));
        }
    }

    /// Close all maintained streams.
    pub fn end(&self) {
        let mut tasks = self.tasks.lock().expect("subscribe-to mutex poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn maintain(
        self: Arc<Self>,
        index: usize,
        client: Arc<LibrarianClient>,
        routing: Arc<Mutex<RoutingTable>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if *stop.borrow() {
                return;
            }

            let peer = {
                let table = routing.lock().expect("routing table mutex poisoned");
                table.sample(1, &mut rand::thread_rng()).pop()
            };

            if let Some(peer) = peer {
                debug!(
                    subscription = index,
                    peer = %peer.id,
                    "opening subscription stream"
                );
                match client
                    .subscribe(peer.address, Subscription::everything())
                    .await
                {
                    Ok(mut stream) => {
                        backoff = BACKOFF_BASE;
                        loop {
                            tokio::select! {
                                _ = stop.changed() => return,
                                next = stream.next() => match next {
                                    Ok(Some(keyed)) => self.send(keyed),
                                    Ok(None) => {
                                        debug!(subscription = index, "stream closed by peer");
                                        break;
                                    }
                                    Err(e) => {
                                        debug!(subscription = index, error = %e, "stream error");
                                        break;
                                    }
                                },
                            }
                        }
                    }
                    Err(e) => {
                        debug!(subscription = index, peer = %peer.id, error = %e, "subscribe failed");
                    }
                }
            }

            let wait = jittered(backoff);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-BACKOFF_JITTER..BACKOFF_JITTER);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn keyed(seed: u8) -> KeyedPublication {
        KeyedPublication {
            key: Id::from_bytes([seed; 32]),
            value: Publication {
                entry_key: Id::from_bytes([seed.wrapping_add(1); 32]),
                author_public_key: vec![seed; 64],
                reader_public_key: vec![seed.wrapping_add(2); 64],
            },
        }
    }

    fn from_config(max_subscribers: usize) -> SubscribeFromConfig {
        SubscribeFromConfig {
            max_subscribers,
            send_slack: 4,
        }
    }

    fn to_config() -> SubscribeToConfig {
        SubscribeToConfig {
            n_subscriptions: 2,
            recent_cache_size: 8,
        }
    }

    #[test]
    fn recent_publications_dedup() {
        let recent = RecentPublications::new(4);
        assert!(!recent.seen_or_add(&keyed(1)));
        assert!(recent.seen_or_add(&keyed(1)));
        assert!(!recent.seen_or_add(&keyed(2)));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn recent_publications_evicts_lru() {
        let recent = RecentPublications::new(2);
        recent.seen_or_add(&keyed(1));
        recent.seen_or_add(&keyed(2));
        recent.seen_or_add(&keyed(3));
        // Oldest entry fell out, so it reads as fresh again.
        assert!(!recent.seen_or_add(&keyed(1)));
    }

    #[test]
    fn filter_membership() {
        let author_a = Keypair::generate().public_key_bytes();
        let author_b = Keypair::generate().public_key_bytes();
        let filter = filter_from_keys(&[author_a.clone()], 1e-6);
        assert!(filter.contains(author_a.as_slice()));
        assert!(!filter.contains(author_b.as_slice()));
    }

    #[test]
    fn subscription_for_maps_none_to_wildcard() {
        let sub = subscription_for(None, None, 0.5);
        assert!(sub.author_filter.is_none());
        assert!(sub.reader_filter.is_none());

        let keys = vec![Keypair::generate().public_key_bytes()];
        let sub = subscription_for(Some(&keys), None, 1e-6);
        assert!(sub.author_filter.is_some());
        assert!(sub.reader_filter.is_none());
    }

    #[tokio::test]
    async fn fanout_delivers_to_subscribers() {
        let (new_pubs_tx, new_pubs_rx) = mpsc::channel(NEW_PUBLICATIONS_SLACK);
        let from = SubscribeFrom::new(&from_config(4), new_pubs_rx);

        let mut sub_a = from.subscribe().unwrap();
        let mut sub_b = from.subscribe().unwrap();

        new_pubs_tx.send(keyed(1)).await.unwrap();

        let got_a = tokio::time::timeout(Duration::from_secs(1), sub_a.recv())
            .await
            .unwrap()
            .unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), sub_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_a.key, keyed(1).key);
        assert_eq!(got_b.key, keyed(1).key);
    }

    #[tokio::test]
    async fn subscriber_cap_enforced() {
        let (_new_pubs_tx, new_pubs_rx) = mpsc::channel(NEW_PUBLICATIONS_SLACK);
        let from = SubscribeFrom::new(&from_config(2), new_pubs_rx);

        let _a = from.subscribe().unwrap();
        let _b = from.subscribe().unwrap();
        assert_eq!(
            from.subscribe().err(),
            Some(SubscribeError::NotAcceptingNewSubscriptions)
        );

        drop(_a);
        // Capacity frees once a subscriber goes away.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            if from.subscribe().is_ok() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "slot never freed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let (new_pubs_tx, new_pubs_rx) = mpsc::channel(64);
        let config = from_config(4);
        let from = SubscribeFrom::new(&config, new_pubs_rx);
        let mut sub = from.subscribe().unwrap();

        // Overfill the per-subscriber slack without consuming.
        for i in 0..(config.send_slack as u8 + 4) {
            new_pubs_tx.send(keyed(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        match sub.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                assert!(skipped > 0, "expected skipped publications");
            }
            Ok(first) => {
                // Depending on timing the receiver may first surface a
                // later publication; it must not be the oldest.
                assert_ne!(first.key, keyed(0).key);
            }
            Err(e) => panic!("unexpected receive error: {:?}", e),
        }
    }

    #[tokio::test]
    async fn subscribe_to_send_dedups_and_forwards() {
        let (new_pubs_tx, mut new_pubs_rx) = mpsc::channel(NEW_PUBLICATIONS_SLACK);
        let recent = Arc::new(RecentPublications::new(8));
        let to = SubscribeTo::new(to_config(), recent, new_pubs_tx);

        to.send(keyed(1));
        to.send(keyed(1));
        to.send(keyed(2));

        assert_eq!(new_pubs_rx.recv().await.unwrap().key, keyed(1).key);
        assert_eq!(new_pubs_rx.recv().await.unwrap().key, keyed(2).key);
        assert!(new_pubs_rx.try_recv().is_err(), "duplicate was forwarded");
    }

    #[tokio::test]
    async fn send_drops_and_counts_when_full() {
        let (new_pubs_tx, _new_pubs_rx) = mpsc::channel(2);
        let recent = Arc::new(RecentPublications::new(64));
        let to = SubscribeTo::new(to_config(), recent, new_pubs_tx);

        for i in 0..10u8 {
            to.send(keyed(i));
        }
        assert_eq!(to.dropped_count(), 8);
    }

    #[test]
    fn filter_false_positive_rate_is_bounded() {
        let subscribed = Keypair::generate().public_key_bytes();
        let fp_rate = 0.05;
        let filter = filter_from_keys(&[subscribed], fp_rate);

        let trials = 400;
        let mut false_positives = 0;
        for _ in 0..trials {
            if filter.contains(Keypair::generate().public_key_bytes().as_slice()) {
                false_positives += 1;
            }
        }
        // Allow generous slack over the configured rate.
        let bound = ((trials as f64) * fp_rate * 3.0).ceil() as usize + 5;
        assert!(
            false_positives <= bound,
            "false positive count {} exceeds bound {}",
            false_positives,
            bound
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let wait = jittered(Duration::from_secs(10));
            assert!(wait >= Duration::from_secs(8));
            assert!(wait <= Duration::from_secs(12));
        }
    }
}
