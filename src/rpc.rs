//! # RPC Server
//!
//! The inbound half of the RPC surface: accepts QUIC connections, reads one
//! signed request frame per bidirectional stream, dispatches to the
//! librarian's handlers, and writes the response. Subscribe streams stay
//! open, pushing publication frames until either side closes.
//!
//! Requests are handled concurrently: one task per connection, one task per
//! stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{Endpoint, Incoming};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::client::{read_frame, write_frame};
use crate::messages::{self, Request, Response, SignedRequest};
use crate::node::Librarian;

/// Deadline for reading a request frame off a fresh stream.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serialize and frame one response onto a stream.
pub(crate) async fn write_response(
    send: &mut quinn::SendStream,
    response: &Response,
) -> Result<()> {
    let bytes = messages::serialize(response).context("failed to serialize response")?;
    write_frame(send, &bytes).await
}

/// Accept connections until shutdown.
pub async fn serve(
    endpoint: Endpoint,
    librarian: Arc<Librarian>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let librarian = librarian.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(librarian, incoming).await {
                        debug!(error = %e, "connection error");
                    }
                });
            }
        }
    }
    debug!("server loop stopped");
}

async fn handle_connection(librarian: Arc<Librarian>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();
    trace!(remote = %remote, "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::TimedOut) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let librarian = librarian.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(librarian, stream, remote).await {
                debug!(remote = %remote, error = %e, "stream error");
            }
        });
    }
}

async fn handle_stream(
    librarian: Arc<Librarian>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote: SocketAddr,
) -> Result<()> {
    let frame = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut recv))
        .await
        .map_err(|_| anyhow::anyhow!("request read timed out"))??;
    let signed: SignedRequest =
        messages::deserialize_bounded(&frame).context("failed to deserialize request frame")?;
    let request: Request = messages::deserialize_bounded(&signed.body)
        .context("failed to deserialize request body")?;
    trace!(remote = %remote, op = request.name(), "handling request");

    match request {
        Request::Subscribe {
            metadata,
            subscription,
        } => {
            librarian
                .handle_subscribe(
                    &signed.signature,
                    &signed.body,
                    metadata,
                    subscription,
                    &mut send,
                )
                .await?;
        }
        other => {
            let response = librarian
                .handle_request(&signed.signature, &signed.body, other)
                .await;
            write_response(&mut send, &response).await?;
        }
    }
    send.finish()?;
    Ok(())
}
