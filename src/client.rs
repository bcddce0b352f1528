//! # RPC Client
//!
//! The outbound half of the RPC surface: signs requests, frames them onto
//! QUIC bidirectional streams, and checks that responses echo the request
//! ID they answer. Connections are cached per peer address in an actor that
//! owns the cache and hands out clones on demand.
//!
//! Error responses surface as [`RpcError`] values carrying the server's
//! error kind, so callers can distinguish authentication failures from
//! missing values.

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::id::Id;
use crate::identity::Keypair;
use crate::introduce::{IntroduceQuerier, IntroduceReply};
use crate::messages::{
    self, ErrorKind, PutOperation, Request, RequestMetadata, Response, SignedRequest,
    Subscription, MAX_FRAME_SIZE,
};
use crate::documents::KeyedPublication;
use crate::peer::{Peer, PeerAddress};
use crate::search::{FindReply, SearchQuerier};
use crate::sig::Signer;
use crate::store::StoreQuerier;

/// Maximum cached connections.
const MAX_CACHED_CONNECTIONS: usize = 256;

/// Command channel capacity for the connection actor.
const COMMAND_CHANNEL_SIZE: usize = 128;

/// An error response from a remote librarian.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame(send: &mut quinn::SendStream, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(bytes).await?;
    Ok(())
}

/// Read one length-prefixed frame, bounded by [`MAX_FRAME_SIZE`].
pub(crate) async fn read_frame(recv: &mut quinn::RecvStream) -> Result<Vec<u8>> {
    read_frame_opt(recv)
        .await?
        .context("stream ended before a frame arrived")
}

/// Read one frame, or `None` if the stream finished cleanly first.
pub(crate) async fn read_frame_opt(recv: &mut quinn::RecvStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len as u64 > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }
    let mut bytes = vec![0u8; len];
    recv.read_exact(&mut bytes).await?;
    Ok(Some(bytes))
}

enum Command {
    GetOrConnect {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Invalidate {
        addr: SocketAddr,
    },
    Quit,
}

struct ConnectionActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connections: LruCache<SocketAddr, Connection>,
}

impl ConnectionActor {
    fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        Self {
            endpoint,
            client_config,
            connections: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("cache capacity is non-zero"),
            ),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::GetOrConnect { addr, reply } => {
                    let _ = reply.send(self.get_or_connect(addr).await);
                }
                Command::Invalidate { addr } => {
                    if self.connections.pop(&addr).is_some() {
                        trace!(addr = %addr, "invalidated cached connection");
                    }
                }
                Command::Quit => break,
            }
        }
        debug!("connection actor shutting down");
    }

    async fn get_or_connect(&mut self, addr: SocketAddr) -> Result<Connection> {
        if let Some(conn) = self.connections.get(&addr) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            self.connections.pop(&addr);
        }
        let conn = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, "librarian")
            .with_context(|| format!("failed to initiate connection to {}", addr))?
            .await
            .with_context(|| format!("failed to establish connection to {}", addr))?;
        self.connections.put(addr, conn.clone());
        Ok(conn)
    }
}

/// Signed RPC client for all seven librarian operations.
#[derive(Clone)]
pub struct LibrarianClient {
    signer: Signer,
    public_key: Vec<u8>,
    self_address: PeerAddress,
    cmd_tx: mpsc::Sender<Command>,
}

impl LibrarianClient {
    pub fn new(
        endpoint: Endpoint,
        client_config: ClientConfig,
        keypair: &Keypair,
        self_address: PeerAddress,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(ConnectionActor::new(endpoint, client_config).run(cmd_rx));
        Self {
            signer: Signer::new(keypair.clone()),
            public_key: keypair.public_key_bytes(),
            self_address,
            cmd_tx,
        }
    }

    pub fn self_address(&self) -> &PeerAddress {
        &self.self_address
    }

    /// Fresh request metadata for this client's identity.
    pub fn new_metadata(&self) -> RequestMetadata {
        RequestMetadata::new(self.public_key.clone())
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn get_or_connect(&self, addr: SocketAddr) -> Result<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetOrConnect {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("connection actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("connection actor closed"))?
    }

    async fn invalidate(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(Command::Invalidate { addr }).await;
    }

    fn signed_frame(&self, request: &Request) -> Result<Vec<u8>> {
        let body = messages::serialize(request).context("failed to serialize request")?;
        let signature = self.signer.sign(&body);
        messages::serialize(&SignedRequest { signature, body })
            .context("failed to serialize request frame")
    }

    /// Send one request and await its single response.
    pub async fn request(&self, addr: SocketAddr, request: &Request) -> Result<Response> {
        let frame = self.signed_frame(request)?;
        let conn = self.get_or_connect(addr).await?;

        let exchanged = async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;
            write_frame(&mut send, &frame).await?;
            send.finish()?;
            let bytes = read_frame(&mut recv).await?;
            let response: Response = messages::deserialize_bounded(&bytes)
                .context("failed to deserialize response")?;
            Ok::<_, anyhow::Error>(response)
        }
        .await;

        let response = match exchanged {
            Ok(response) => response,
            Err(e) => {
                self.invalidate(addr).await;
                return Err(e);
            }
        };

        if response.metadata().request_id != request.metadata().request_id {
            anyhow::bail!("response echoes a different request ID");
        }
        if let Response::Error { kind, message, .. } = response {
            return Err(RpcError { kind, message }.into());
        }
        Ok(response)
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<String> {
        let request = Request::Ping {
            metadata: self.new_metadata(),
        };
        match self.request(addr, &request).await? {
            Response::Ping { message, .. } => Ok(message),
            other => anyhow::bail!("unexpected response to ping: {:?}", other),
        }
    }

    pub async fn find(
        &self,
        addr: SocketAddr,
        key: Id,
        num_peers: u32,
    ) -> Result<(Option<Vec<u8>>, Vec<PeerAddress>)> {
        let request = Request::Find {
            metadata: self.new_metadata(),
            key,
            num_peers,
        };
        match self.request(addr, &request).await? {
            Response::Find { value, peers, .. } => Ok((value, peers)),
            other => anyhow::bail!("unexpected response to find: {:?}", other),
        }
    }

    pub async fn store(&self, addr: SocketAddr, key: Id, value: Vec<u8>) -> Result<()> {
        let request = Request::Store {
            metadata: self.new_metadata(),
            key,
            value,
        };
        match self.request(addr, &request).await? {
            Response::Store { .. } => Ok(()),
            other => anyhow::bail!("unexpected response to store: {:?}", other),
        }
    }

    pub async fn get(&self, addr: SocketAddr, key: Id) -> Result<Option<Vec<u8>>> {
        let request = Request::Get {
            metadata: self.new_metadata(),
            key,
        };
        match self.request(addr, &request).await? {
            Response::Get { value, .. } => Ok(value),
            other => anyhow::bail!("unexpected response to get: {:?}", other),
        }
    }

    pub async fn put(
        &self,
        addr: SocketAddr,
        key: Id,
        value: Vec<u8>,
    ) -> Result<(PutOperation, u32)> {
        let request = Request::Put {
            metadata: self.new_metadata(),
            key,
            value,
        };
        match self.request(addr, &request).await? {
            Response::Put {
                operation,
                n_replicas,
                ..
            } => Ok((operation, n_replicas)),
            other => anyhow::bail!("unexpected response to put: {:?}", other),
        }
    }

    pub async fn introduce(
        &self,
        addr: SocketAddr,
        num_peers: u32,
    ) -> Result<(PeerAddress, Vec<PeerAddress>)> {
        let request = Request::Introduce {
            metadata: self.new_metadata(),
            self_address: self.self_address.clone(),
            num_peers,
        };
        match self.request(addr, &request).await? {
            Response::Introduce {
                self_address,
                peers,
                ..
            } => Ok((self_address, peers)),
            other => anyhow::bail!("unexpected response to introduce: {:?}", other),
        }
    }

    /// Open a subscription stream. The returned stream yields publications
    /// until either side closes.
    pub async fn subscribe(
        &self,
        addr: SocketAddr,
        subscription: Subscription,
    ) -> Result<PublicationStream> {
        let request = Request::Subscribe {
            metadata: self.new_metadata(),
            subscription,
        };
        let request_id = request.metadata().request_id;
        let frame = self.signed_frame(&request)?;
        let conn = self.get_or_connect(addr).await?;

        let (mut send, recv) = conn
            .open_bi()
            .await
            .context("failed to open subscription stream")?;
        if let Err(e) = write_frame(&mut send, &frame).await {
            self.invalidate(addr).await;
            return Err(e);
        }
        send.finish()?;

        Ok(PublicationStream { recv, request_id })
    }
}

/// A server-push stream of publications from one Subscribe call.
pub struct PublicationStream {
    recv: quinn::RecvStream,
    request_id: messages::RequestId,
}

impl PublicationStream {
    /// The next publication, or `None` when the server closed the stream.
    pub async fn next(&mut self) -> Result<Option<KeyedPublication>> {
        let Some(bytes) = read_frame_opt(&mut self.recv).await? else {
            return Ok(None);
        };
        let response: Response = messages::deserialize_bounded(&bytes)
            .context("failed to deserialize subscription frame")?;
        if response.metadata().request_id != self.request_id {
            anyhow::bail!("subscription frame echoes a different request ID");
        }
        match response {
            Response::Subscription { publication, .. } => Ok(Some(publication)),
            Response::Error { kind, message, .. } => Err(RpcError { kind, message }.into()),
            other => anyhow::bail!("unexpected frame on subscription stream: {:?}", other),
        }
    }
}

#[async_trait]
impl SearchQuerier for LibrarianClient {
    async fn find(&self, peer: &Peer, target: Id, num_peers: u32) -> Result<FindReply> {
        let (value, peers) = self.find(peer.address, target, num_peers).await?;
        Ok(FindReply { value, peers })
    }
}

#[async_trait]
impl IntroduceQuerier for LibrarianClient {
    async fn introduce(&self, peer: &Peer, num_peers: u32) -> Result<IntroduceReply> {
        let (self_address, peers) = self.introduce(peer.address, num_peers).await?;
        Ok(IntroduceReply {
            self_address,
            peers,
        })
    }
}

#[async_trait]
impl StoreQuerier for LibrarianClient {
    async fn store(&self, peer: &Peer, key: Id, value: Vec<u8>) -> Result<()> {
        self.store(peer.address, key, value).await
    }
}
