//! # Peer Records
//!
//! A [`Peer`] is the routing table's view of another librarian: its ID, a
//! human-readable name, a public address, and [`QueryOutcomes`] counters
//! tracking how our exchanges with it have gone. Outcomes are recorded per
//! direction: `Request` for inbound requests from the peer, `Response` for
//! replies the peer sends to our outbound queries.
//!
//! [`PeerAddress`] is the wire form exchanged in Introduce and Find
//! responses.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// Direction of a recorded query, relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDirection {
    /// An inbound request from the peer.
    Request,
    /// A response the peer sent to our outbound query.
    Response,
}

/// Outcome of a recorded query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Success,
    Error,
}

/// Counters for one query direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeStats {
    /// Unix seconds of the first recorded query, 0 if none.
    pub earliest: u64,
    /// Unix seconds of the most recent recorded query, 0 if none.
    pub latest: u64,
    pub n_queries: u64,
    pub n_errors: u64,
}

impl OutcomeStats {
    fn record(&mut self, outcome: QueryOutcome) {
        let now = unix_seconds();
        if self.earliest == 0 {
            self.earliest = now;
        }
        self.latest = now;
        self.n_queries += 1;
        if outcome == QueryOutcome::Error {
            self.n_errors += 1;
        }
    }
}

/// Per-direction query counters for a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutcomes {
    pub requests: OutcomeStats,
    pub responses: OutcomeStats,
}

impl QueryOutcomes {
    pub fn record(&mut self, direction: QueryDirection, outcome: QueryOutcome) {
        match direction {
            QueryDirection::Request => self.requests.record(outcome),
            QueryDirection::Response => self.responses.record(outcome),
        }
    }
}

/// The wire form of a peer: what Introduce and Find responses carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: Id,
    pub name: String,
    pub address: SocketAddr,
}

/// A peer as tracked by the routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: Id,
    pub name: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub outcomes: QueryOutcomes,
}

impl Peer {
    pub fn new(id: Id, name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            outcomes: QueryOutcomes::default(),
        }
    }

    pub fn from_address(address: &PeerAddress) -> Self {
        Self::new(address.peer_id, address.name.clone(), address.address)
    }

    pub fn to_address(&self) -> PeerAddress {
        PeerAddress {
            peer_id: self.id,
            name: self.name.clone(),
            address: self.address,
        }
    }

    pub fn record(&mut self, direction: QueryDirection, outcome: QueryOutcome) {
        self.outcomes.record(direction, outcome);
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert peers to their wire addresses.
pub fn to_addresses(peers: &[Peer]) -> Vec<PeerAddress> {
    peers.iter().map(Peer::to_address).collect()
}
