//! # The Librarian Node
//!
//! [`Node`] is the long-lived process facade: it opens the database, loads
//! or creates the node identity and routing table, binds the QUIC endpoint,
//! starts serving, and begins the subscription fan-in. [`Librarian`] holds
//! the request handlers behind it.
//!
//! Every handler follows the same shape: verify the request signature,
//! validate keys and values, record the outcome against the caller's peer
//! record, run the handler-specific logic, and respond echoing the request
//! ID.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::Endpoint;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::client::LibrarianClient;
use crate::config::Config;
use crate::documents::{publication_from, Document};
use crate::id::Id;
use crate::identity::Keypair;
use crate::introduce::{Introducer, Introduction, IntroduceParams};
use crate::messages::{
    ErrorKind, PutOperation, Request, RequestMetadata, Response, ResponseMetadata, Subscription,
};
use crate::peer::{to_addresses, Peer, PeerAddress, QueryDirection, QueryOutcome};
use crate::routing::RoutingTable;
use crate::rpc;
use crate::search::{Search, SearchParams, Searcher};
use crate::sig::{EcdsaVerifier, RequestVerifier};
use crate::storage::{
    check_key_value, DocumentStore, Kvdb, RedbStore, ServerStore, StorageError,
};
use crate::store::{Store, StoreParams, Storer};
use crate::subscribe::{
    RecentPublications, SubscribeFrom, SubscribeTo, NEW_PUBLICATIONS_SLACK,
};
use crate::tls;

/// Server-namespace key holding the node's secret identity key.
pub const IDENTITY_KEY: &[u8] = b"identity";

/// Grace period for draining in-flight requests at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between periodic routing-table snapshots.
const ROUTING_SAVE_INTERVAL: Duration = Duration::from_secs(300);

/// The request-handling core of a node.
pub struct Librarian {
    self_id: Id,
    config: Config,
    api_self: PeerAddress,
    routing: Arc<Mutex<RoutingTable>>,
    verifier: Arc<dyn RequestVerifier>,
    documents: DocumentStore,
    searcher: Searcher,
    storer: Storer,
    subscribe_from: Arc<SubscribeFrom>,
    subscribe_to: Arc<SubscribeTo>,
    stop_rx: watch::Receiver<bool>,
}

impl Librarian {
    pub fn self_id(&self) -> Id {
        self.self_id
    }

    fn error(
        &self,
        metadata: &RequestMetadata,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Response {
        Response::Error {
            metadata: ResponseMetadata::echoing(metadata),
            kind,
            message: message.into(),
        }
    }

    /// Verify the request token, returning the caller's derived peer ID.
    fn verify(
        &self,
        signature: &str,
        body: &[u8],
        metadata: &RequestMetadata,
    ) -> Result<Id, Response> {
        self.verifier
            .verify(signature, &metadata.public_key, body)
            .map_err(|e| self.error(metadata, ErrorKind::Unauthenticated, e.to_string()))
    }

    fn record(&self, peer_id: &Id, direction: QueryDirection, outcome: QueryOutcome) {
        let mut routing = self.routing.lock().expect("routing table mutex poisoned");
        routing.record(peer_id, direction, outcome);
    }

    fn push_responded(&self, peers: Vec<Peer>) {
        let mut routing = self.routing.lock().expect("routing table mutex poisoned");
        for peer in peers {
            let id = peer.id;
            routing.push(peer);
            routing.record(&id, QueryDirection::Response, QueryOutcome::Success);
        }
    }

    /// Handle one unary request. `signature` and `body` are the frame parts
    /// the token verification binds together.
    pub(crate) async fn handle_request(
        &self,
        signature: &str,
        body: &[u8],
        request: Request,
    ) -> Response {
        match request {
            Request::Ping { metadata } => Response::Ping {
                metadata: ResponseMetadata::echoing(&metadata),
                message: "pong".to_string(),
            },
            Request::Introduce {
                metadata,
                self_address,
                num_peers,
            } => self.handle_introduce(signature, body, metadata, self_address, num_peers),
            Request::Find {
                metadata,
                key,
                num_peers,
            } => self.handle_find(signature, body, metadata, key, num_peers),
            Request::Store {
                metadata,
                key,
                value,
            } => self.handle_store(signature, body, metadata, key, value),
            Request::Get { metadata, key } => {
                self.handle_get(signature, body, metadata, key).await
            }
            Request::Put {
                metadata,
                key,
                value,
            } => self.handle_put(signature, body, metadata, key, value).await,
            Request::Subscribe { metadata, .. } => self.error(
                &metadata,
                ErrorKind::InvalidArgument,
                "subscribe requires a streaming call",
            ),
        }
    }

    fn handle_introduce(
        &self,
        signature: &str,
        body: &[u8],
        metadata: RequestMetadata,
        self_address: PeerAddress,
        num_peers: u32,
    ) -> Response {
        let requester_id = match self.verify(signature, body, &metadata) {
            Ok(id) => id,
            Err(response) => return response,
        };
        if self_address.peer_id != requester_id {
            return self.error(
                &metadata,
                ErrorKind::Unauthenticated,
                "stated peer ID does not match signature",
            );
        }

        let peers = {
            let mut routing = self.routing.lock().expect("routing table mutex poisoned");
            routing.push(Peer::from_address(&self_address));
            routing.record(&requester_id, QueryDirection::Request, QueryOutcome::Success);

            // Seed the sample from the request ID so retries see the same
            // peer set.
            let seed = u64::from_be_bytes(
                metadata.request_id[..8]
                    .try_into()
                    .expect("request IDs are 32 bytes"),
            );
            routing.sample(num_peers as usize, &mut StdRng::seed_from_u64(seed))
        };

        debug!(requester = %requester_id, n_peers = peers.len(), "introduced");
        Response::Introduce {
            metadata: ResponseMetadata::echoing(&metadata),
            self_address: self.api_self.clone(),
            peers: to_addresses(&peers),
        }
    }

    fn handle_find(
        &self,
        signature: &str,
        body: &[u8],
        metadata: RequestMetadata,
        key: Id,
        num_peers: u32,
    ) -> Response {
        let requester_id = match self.verify(signature, body, &metadata) {
            Ok(id) => id,
            Err(response) => return response,
        };
        self.record(&requester_id, QueryDirection::Request, QueryOutcome::Success);

        match self.documents.load(&key) {
            Ok(Some(value)) => Response::Find {
                metadata: ResponseMetadata::echoing(&metadata),
                value: Some(value),
                peers: vec![],
            },
            Ok(None) => {
                let closest = {
                    let routing = self.routing.lock().expect("routing table mutex poisoned");
                    routing.peak(&key, num_peers as usize)
                };
                Response::Find {
                    metadata: ResponseMetadata::echoing(&metadata),
                    value: None,
                    peers: to_addresses(&closest),
                }
            }
            Err(e) => self.error(&metadata, ErrorKind::Internal, e.to_string()),
        }
    }

    fn handle_store(
        &self,
        signature: &str,
        body: &[u8],
        metadata: RequestMetadata,
        key: Id,
        value: Vec<u8>,
    ) -> Response {
        let requester_id = match self.verify(signature, body, &metadata) {
            Ok(id) => id,
            Err(response) => return response,
        };

        let document = match Document::deserialize(&value) {
            Ok(document) => document,
            Err(e) => return self.error(&metadata, ErrorKind::InvalidArgument, e.to_string()),
        };
        if let Err(e) = self.documents.store(&key, &value) {
            let kind = match e {
                StorageError::Db(_) | StorageError::Closed => ErrorKind::Internal,
                _ => ErrorKind::InvalidArgument,
            };
            return self.error(&metadata, kind, e.to_string());
        }
        self.record(&requester_id, QueryDirection::Request, QueryOutcome::Success);

        if let Some(keyed) = publication_from(key, &document) {
            self.subscribe_to.send(keyed);
        }

        debug!(key = %key, requester = %requester_id, "stored document");
        Response::Store {
            metadata: ResponseMetadata::echoing(&metadata),
        }
    }

    async fn handle_get(
        &self,
        signature: &str,
        body: &[u8],
        metadata: RequestMetadata,
        key: Id,
    ) -> Response {
        let requester_id = match self.verify(signature, body, &metadata) {
            Ok(id) => id,
            Err(response) => return response,
        };
        self.record(&requester_id, QueryDirection::Request, QueryOutcome::Success);

        let search = Arc::new(Search::new(
            self.self_id,
            key,
            SearchParams::from(&self.config.search),
        ));
        let seeds = {
            let routing = self.routing.lock().expect("routing table mutex poisoned");
            routing.peak(&key, self.config.search.concurrency)
        };
        if let Err(e) = self.searcher.search(&search, seeds).await {
            return self.error(&metadata, ErrorKind::Internal, e.to_string());
        }
        self.push_responded(search.closest_peers());

        if let Some(value) = search.value() {
            if check_key_value(&key, &value).is_err() {
                return self.error(
                    &metadata,
                    ErrorKind::Internal,
                    "found value does not match key",
                );
            }
            info!(key = %key, "got value");
            return Response::Get {
                metadata: ResponseMetadata::echoing(&metadata),
                value: Some(value),
            };
        }
        if search.found_closest_peers() {
            info!(key = %key, "did not get value");
            return Response::Get {
                metadata: ResponseMetadata::echoing(&metadata),
                value: None,
            };
        }
        if search.errored() {
            return self.error(&metadata, ErrorKind::Internal, "search for key errored");
        }
        self.error(&metadata, ErrorKind::NotFound, "search for key exhausted")
    }

    async fn handle_put(
        &self,
        signature: &str,
        body: &[u8],
        metadata: RequestMetadata,
        key: Id,
        value: Vec<u8>,
    ) -> Response {
        let requester_id = match self.verify(signature, body, &metadata) {
            Ok(id) => id,
            Err(response) => return response,
        };
        if let Err(e) = check_key_value(&key, &value) {
            return self.error(&metadata, ErrorKind::InvalidArgument, e.to_string());
        }
        if let Err(e) = Document::deserialize(&value).and_then(|d| d.check().map(|_| d)) {
            return self.error(&metadata, ErrorKind::InvalidArgument, e.to_string());
        }
        self.record(&requester_id, QueryDirection::Request, QueryOutcome::Success);

        let store = Arc::new(Store::new(
            self.self_id,
            key,
            value,
            SearchParams::from(&self.config.search),
            StoreParams::from(&self.config.store),
        ));
        let seeds = {
            let routing = self.routing.lock().expect("routing table mutex poisoned");
            routing.peak(&key, self.config.search.concurrency)
        };
        if let Err(e) = self.storer.store(&store, seeds).await {
            return self.error(&metadata, ErrorKind::Internal, e.to_string());
        }
        self.push_responded(store.responded_peers());

        if store.stored() {
            info!(key = %key, n_replicas = store.n_replicas(), "put value");
            return Response::Put {
                metadata: ResponseMetadata::echoing(&metadata),
                operation: PutOperation::Stored,
                n_replicas: store.n_replicas() as u32,
            };
        }
        if store.exists() {
            info!(key = %key, "left existing value");
            return Response::Put {
                metadata: ResponseMetadata::echoing(&metadata),
                operation: PutOperation::LeftExisting,
                n_replicas: store.n_replicas() as u32,
            };
        }
        if store.errored() {
            return self.error(
                &metadata,
                ErrorKind::Internal,
                "error during search or store operations",
            );
        }
        self.error(&metadata, ErrorKind::Internal, "store for key exhausted")
    }

    /// Handle one Subscribe call as a server-push stream on `send`.
    pub(crate) async fn handle_subscribe(
        &self,
        signature: &str,
        body: &[u8],
        metadata: RequestMetadata,
        subscription: Subscription,
        send: &mut quinn::SendStream,
    ) -> Result<()> {
        if let Err(response) = self.verify(signature, body, &metadata) {
            rpc::write_response(send, &response).await?;
            return Ok(());
        }

        let mut pubs = match self.subscribe_from.subscribe() {
            Ok(pubs) => pubs,
            Err(e) => {
                let response =
                    self.error(&metadata, ErrorKind::Unavailable, e.to_string());
                rpc::write_response(send, &response).await?;
                return Ok(());
            }
        };

        let response_metadata = ResponseMetadata::echoing(&metadata);
        let mut stop = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                received = pubs.recv() => match received {
                    Ok(keyed) => {
                        if !subscription.matches(&keyed.value) {
                            continue;
                        }
                        let frame = Response::Subscription {
                            metadata: response_metadata.clone(),
                            publication: keyed,
                        };
                        // A write failure means the client went away, which
                        // ends the subscription cleanly.
                        if rpc::write_response(send, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscriber lagged, dropped oldest publications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}

/// A running librarian process.
pub struct Node {
    librarian: Arc<Librarian>,
    keypair: Keypair,
    client: Arc<LibrarianClient>,
    routing: Arc<Mutex<RoutingTable>>,
    db: Arc<dyn Kvdb>,
    server_store: ServerStore,
    introducer: Introducer,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    subscribe_to: Arc<SubscribeTo>,
    config: Config,
}

impl Node {
    /// Open storage, load or create identity and routing state, bind the
    /// endpoint, and begin serving.
    pub async fn start(config: Config) -> Result<Self> {
        std::fs::create_dir_all(config.db_dir())
            .with_context(|| format!("failed to create {}", config.db_dir().display()))?;
        std::fs::create_dir_all(config.keys_dir())
            .with_context(|| format!("failed to create {}", config.keys_dir().display()))?;

        let db: Arc<dyn Kvdb> = Arc::new(
            RedbStore::open(config.db_dir().join("libri.redb"))
                .context("failed to open database")?,
        );
        let server_store = ServerStore::new(db.clone());
        let documents = DocumentStore::new(db.clone());

        let keypair = load_or_create_identity(&server_store)?;
        let self_id = keypair.peer_id();

        let routing = match RoutingTable::load(&server_store, self_id, config.routing.clone())
            .context("failed to load routing table")?
        {
            Some(table) => {
                info!(n_peers = table.num_peers(), "loaded routing table");
                table
            }
            None => RoutingTable::new(self_id, config.routing.clone()),
        };
        let routing = Arc::new(Mutex::new(routing));

        let endpoint = Endpoint::server(tls::server_config()?, config.local_addr)
            .context("failed to bind endpoint")?;
        let local_addr = endpoint.local_addr()?;
        let public_addr = if config.public_addr.port() == 0 {
            local_addr
        } else {
            config.public_addr
        };
        let api_self = PeerAddress {
            peer_id: self_id,
            name: config.public_name.clone(),
            address: public_addr,
        };

        let client = Arc::new(LibrarianClient::new(
            endpoint.clone(),
            tls::client_config()?,
            &keypair,
            api_self.clone(),
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let searcher = Searcher::new(client.clone(), stop_rx.clone());
        let storer = Storer::new(searcher.clone(), client.clone(), stop_rx.clone());
        let introducer = Introducer::new(client.clone(), stop_rx.clone());

        let (new_pubs_tx, new_pubs_rx) = mpsc::channel(NEW_PUBLICATIONS_SLACK);
        let recent = Arc::new(RecentPublications::new(
            config.subscribe_to.recent_cache_size,
        ));
        let subscribe_from = SubscribeFrom::new(&config.subscribe_from, new_pubs_rx);
        let subscribe_to =
            SubscribeTo::new(config.subscribe_to.clone(), recent, new_pubs_tx);

        let librarian = Arc::new(Librarian {
            self_id,
            config: config.clone(),
            api_self,
            routing: routing.clone(),
            verifier: Arc::new(EcdsaVerifier),
            documents,
            searcher,
            storer,
            subscribe_from,
            subscribe_to: subscribe_to.clone(),
            stop_rx: stop_rx.clone(),
        });

        tokio::spawn(rpc::serve(
            endpoint.clone(),
            librarian.clone(),
            stop_rx.clone(),
        ));
        {
            let routing = routing.clone();
            let server_store = server_store.clone();
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ROUTING_SAVE_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = interval.tick() => {
                            let saved = routing
                                .lock()
                                .expect("routing table mutex poisoned")
                                .save(&server_store);
                            if let Err(e) = saved {
                                warn!(error = %e, "periodic routing-table save failed");
                            }
                        }
                    }
                }
            });
        }
        subscribe_to.begin(client.clone(), routing.clone(), stop_rx);

        info!(self_id = %self_id, addr = %local_addr, "librarian serving");
        Ok(Self {
            librarian,
            keypair,
            client,
            routing,
            db,
            server_store,
            introducer,
            endpoint,
            local_addr,
            stop_tx,
            subscribe_to,
            config,
        })
    }

    pub fn peer_id(&self) -> Id {
        self.librarian.self_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The signed RPC client bound to this node's identity.
    pub fn client(&self) -> &Arc<LibrarianClient> {
        &self.client
    }

    pub fn num_peers(&self) -> usize {
        self.routing
            .lock()
            .expect("routing table mutex poisoned")
            .num_peers()
    }

    /// Whether `id` is an active peer in the routing table.
    pub fn knows_peer(&self, id: &Id) -> bool {
        self.routing
            .lock()
            .expect("routing table mutex poisoned")
            .get(id)
            .is_some()
    }

    /// Publications dropped on the fan-in path because of backpressure.
    pub fn dropped_publications(&self) -> u64 {
        self.subscribe_to.dropped_count()
    }

    /// Run an Introduce iteration against the bootstrap peers before
    /// serving traffic. Returns the number of peers discovered.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let seed_peers: Vec<Peer> = seeds
            .iter()
            .map(|addr| {
                // Bootstrap peers have addresses but unknown IDs yet; the
                // placeholder is replaced by what Introduce reports.
                Peer::new(Id::random(&mut rand::thread_rng()), "bootstrap", *addr)
            })
            .collect();

        let intro = Arc::new(Introduction::new(
            self.peer_id(),
            IntroduceParams::from(&self.config.introduce),
        ));
        self.introducer.introduce(&intro, seed_peers).await?;

        let responded = intro.responded_peers();
        if responded.is_empty() {
            anyhow::bail!("no bootstrap peers responded");
        }
        let n = responded.len();
        {
            let mut routing = self.routing.lock().expect("routing table mutex poisoned");
            for peer in responded {
                routing.push(peer);
            }
        }
        info!(n_peers = n, "bootstrapped");
        Ok(n)
    }

    /// Put a document into the network through this node.
    pub async fn put(&self, key: Id, value: Vec<u8>) -> Result<(PutOperation, u32)> {
        self.client.put(self.local_addr, key, value).await
    }

    /// Get a document from the network through this node.
    pub async fn get(&self, key: Id) -> Result<Option<Vec<u8>>> {
        self.client.get(self.local_addr, key).await
    }

    /// Stop serving, drain in-flight work, and persist state.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.subscribe_to.end();
        self.client.quit().await;

        self.endpoint.close(0u32.into(), b"shutdown");
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, self.endpoint.wait_idle()).await;

        {
            let routing = self.routing.lock().expect("routing table mutex poisoned");
            if let Err(e) = routing.save(&self.server_store) {
                warn!(error = %e, "failed to persist routing table");
            }
        }
        if let Err(e) = self.db.close() {
            warn!(error = %e, "failed to close database");
        }
        info!(self_id = %self.peer_id(), "librarian stopped");
    }
}

fn load_or_create_identity(store: &ServerStore) -> Result<Keypair> {
    if let Some(bytes) = store.load(IDENTITY_KEY)? {
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .context("persisted identity has wrong length")?;
        return Keypair::from_secret_bytes(&secret).context("persisted identity is invalid");
    }
    let keypair = Keypair::generate();
    store.store(IDENTITY_KEY, &keypair.secret_bytes())?;
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::MemKvdb;

    #[test]
    fn identity_is_created_once() {
        let store = ServerStore::new(Arc::new(MemKvdb::default()));
        let first = load_or_create_identity(&store).unwrap();
        let second = load_or_create_identity(&store).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn corrupted_identity_is_an_error() {
        let store = ServerStore::new(Arc::new(MemKvdb::default()));
        store.store(IDENTITY_KEY, b"short").unwrap();
        assert!(load_or_create_identity(&store).is_err());
    }
}
