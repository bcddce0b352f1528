//! # Wire Protocol Messages
//!
//! The librarian RPC surface is seven operations carried as bincode frames
//! over QUIC bidirectional streams. Each frame is a u32 big-endian length
//! followed by the serialized message; all deserialization is bounded.
//!
//! | Operation | Request | Success response |
//! |---|---|---|
//! | Ping | `Request::Ping` | `Response::Ping` ("pong") |
//! | Introduce | `Request::Introduce` | self + sampled peers |
//! | Find | `Request::Find` | value or closest peers |
//! | Store | `Request::Store` | ack |
//! | Get | `Request::Get` | value or none |
//! | Put | `Request::Put` | operation + replica count |
//! | Subscribe | `Request::Subscribe` | stream of `Response::Subscription` |
//!
//! Requests ride inside a [`SignedRequest`] envelope: the serialized body
//! plus the compact-JWS token that signs it. Response metadata echoes the
//! request ID and carries a fresh server-generated response ID.

use bincode::Options;
use growable_bloom_filter::GrowableBloom;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::documents::{KeyedPublication, Publication, MAX_DOCUMENT_SIZE};
use crate::id::Id;
use crate::peer::PeerAddress;

/// Length of request and response correlation tokens.
pub const REQUEST_ID_LENGTH: usize = 32;

/// A 32-byte opaque correlation token.
pub type RequestId = [u8; REQUEST_ID_LENGTH];

/// Maximum size of a deserialized frame: the largest document plus framing
/// overhead.
pub const MAX_FRAME_SIZE: u64 = MAX_DOCUMENT_SIZE + 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

/// Serialize a wire message.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize a wire message with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Generate a fresh random correlation token.
pub fn new_request_id() -> RequestId {
    let mut id = [0u8; REQUEST_ID_LENGTH];
    rand::Rng::fill(&mut rand::thread_rng(), &mut id[..]);
    id
}

/// Metadata every request carries: a correlation token and the sender's
/// 64-byte public key, which must hash to any peer ID the body claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: RequestId,
    pub public_key: Vec<u8>,
}

impl RequestMetadata {
    pub fn new(public_key: Vec<u8>) -> Self {
        Self {
            request_id: new_request_id(),
            public_key,
        }
    }
}

/// Metadata every response carries: the echoed request ID plus a fresh
/// server-generated response ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: RequestId,
    pub response_id: RequestId,
}

impl ResponseMetadata {
    pub fn echoing(request: &RequestMetadata) -> Self {
        Self {
            request_id: request.request_id,
            response_id: new_request_id(),
        }
    }
}

/// Per-subscription publication filters. `None` means match-everything; a
/// publication is delivered iff both the author and reader keys test
/// positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub author_filter: Option<GrowableBloom>,
    pub reader_filter: Option<GrowableBloom>,
}

impl Subscription {
    /// A subscription that matches every publication.
    pub fn everything() -> Self {
        Self {
            author_filter: None,
            reader_filter: None,
        }
    }

    pub fn matches(&self, publication: &Publication) -> bool {
        let author_ok = match &self.author_filter {
            Some(filter) => filter.contains(publication.author_public_key.as_slice()),
            None => true,
        };
        let reader_ok = match &self.reader_filter {
            Some(filter) => filter.contains(publication.reader_public_key.as_slice()),
            None => true,
        };
        author_ok && reader_ok
    }
}

/// The seven librarian operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Ping {
        metadata: RequestMetadata,
    },
    Introduce {
        metadata: RequestMetadata,
        self_address: PeerAddress,
        num_peers: u32,
    },
    Find {
        metadata: RequestMetadata,
        key: Id,
        num_peers: u32,
    },
    Store {
        metadata: RequestMetadata,
        key: Id,
        value: Vec<u8>,
    },
    Get {
        metadata: RequestMetadata,
        key: Id,
    },
    Put {
        metadata: RequestMetadata,
        key: Id,
        value: Vec<u8>,
    },
    Subscribe {
        metadata: RequestMetadata,
        subscription: Subscription,
    },
}

impl Request {
    pub fn metadata(&self) -> &RequestMetadata {
        match self {
            Request::Ping { metadata } => metadata,
            Request::Introduce { metadata, .. } => metadata,
            Request::Find { metadata, .. } => metadata,
            Request::Store { metadata, .. } => metadata,
            Request::Get { metadata, .. } => metadata,
            Request::Put { metadata, .. } => metadata,
            Request::Subscribe { metadata, .. } => metadata,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::Introduce { .. } => "introduce",
            Request::Find { .. } => "find",
            Request::Store { .. } => "store",
            Request::Get { .. } => "get",
            Request::Put { .. } => "put",
            Request::Subscribe { .. } => "subscribe",
        }
    }
}

/// What a Put did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOperation {
    Stored,
    LeftExisting,
}

/// Error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid key length, hash mismatch, missing field.
    InvalidArgument,
    /// Missing/invalid signature or peer-ID mismatch.
    Unauthenticated,
    /// A search exhausted without finding the value.
    NotFound,
    /// Subscription capacity reached.
    Unavailable,
    /// Internal iterator or storage failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::NotFound => "not found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Responses to the seven operations, plus the streamed subscription frame
/// and the error frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ping {
        metadata: ResponseMetadata,
        message: String,
    },
    Introduce {
        metadata: ResponseMetadata,
        self_address: PeerAddress,
        peers: Vec<PeerAddress>,
    },
    Find {
        metadata: ResponseMetadata,
        value: Option<Vec<u8>>,
        peers: Vec<PeerAddress>,
    },
    Store {
        metadata: ResponseMetadata,
    },
    Get {
        metadata: ResponseMetadata,
        value: Option<Vec<u8>>,
    },
    Put {
        metadata: ResponseMetadata,
        operation: PutOperation,
        n_replicas: u32,
    },
    /// One publication on a subscribe stream.
    Subscription {
        metadata: ResponseMetadata,
        publication: KeyedPublication,
    },
    Error {
        metadata: ResponseMetadata,
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn metadata(&self) -> &ResponseMetadata {
        match self {
            Response::Ping { metadata, .. } => metadata,
            Response::Introduce { metadata, .. } => metadata,
            Response::Find { metadata, .. } => metadata,
            Response::Store { metadata } => metadata,
            Response::Get { metadata, .. } => metadata,
            Response::Put { metadata, .. } => metadata,
            Response::Subscription { metadata, .. } => metadata,
            Response::Error { metadata, .. } => metadata,
        }
    }
}

/// The outermost request frame: the serialized [`Request`] body plus the
/// compact-JWS token signing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    pub signature: String,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn test_metadata() -> RequestMetadata {
        RequestMetadata::new(Keypair::generate().public_key_bytes())
    }

    fn test_address() -> PeerAddress {
        PeerAddress {
            peer_id: Id::from_bytes([1u8; 32]),
            name: "test".to_string(),
            address: "127.0.0.1:20100".parse().unwrap(),
        }
    }

    #[test]
    fn request_ids_are_unique() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(new_request_id()));
        }
    }

    #[test]
    fn response_metadata_echoes_request_id() {
        let request = test_metadata();
        let response = ResponseMetadata::echoing(&request);
        assert_eq!(response.request_id, request.request_id);
        assert_ne!(response.response_id, request.request_id);
    }

    #[test]
    fn request_variants_roundtrip() {
        let requests = vec![
            Request::Ping {
                metadata: test_metadata(),
            },
            Request::Introduce {
                metadata: test_metadata(),
                self_address: test_address(),
                num_peers: 8,
            },
            Request::Find {
                metadata: test_metadata(),
                key: Id::from_bytes([2u8; 32]),
                num_peers: 20,
            },
            Request::Store {
                metadata: test_metadata(),
                key: Id::from_bytes([3u8; 32]),
                value: b"value".to_vec(),
            },
            Request::Get {
                metadata: test_metadata(),
                key: Id::from_bytes([4u8; 32]),
            },
            Request::Put {
                metadata: test_metadata(),
                key: Id::from_bytes([5u8; 32]),
                value: b"value".to_vec(),
            },
            Request::Subscribe {
                metadata: test_metadata(),
                subscription: Subscription::everything(),
            },
        ];

        for request in requests {
            let bytes = serialize(&request).unwrap();
            let decoded: Request = deserialize_bounded(&bytes).unwrap();
            assert_eq!(decoded.name(), request.name());
            assert_eq!(
                decoded.metadata().request_id,
                request.metadata().request_id
            );
        }
    }

    #[test]
    fn signed_request_roundtrip() {
        let request = Request::Ping {
            metadata: test_metadata(),
        };
        let body = serialize(&request).unwrap();
        let frame = SignedRequest {
            signature: "a.b.c".to_string(),
            body: body.clone(),
        };

        let bytes = serialize(&frame).unwrap();
        let decoded: SignedRequest = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.signature, "a.b.c");
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(deserialize_bounded::<Request>(&[0xFF, 0xFE, 0xFD]).is_err());
        let bytes = serialize(&Request::Ping {
            metadata: test_metadata(),
        })
        .unwrap();
        assert!(deserialize_bounded::<Request>(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn subscription_everything_matches_all() {
        let sub = Subscription::everything();
        let publication = Publication {
            entry_key: Id::from_bytes([9u8; 32]),
            author_public_key: Keypair::generate().public_key_bytes(),
            reader_public_key: Keypair::generate().public_key_bytes(),
        };
        assert!(sub.matches(&publication));
    }

    #[test]
    fn subscription_filters_on_both_keys() {
        let author = Keypair::generate().public_key_bytes();
        let reader = Keypair::generate().public_key_bytes();
        let other = Keypair::generate().public_key_bytes();

        let mut author_filter = GrowableBloom::new(1e-6, 4);
        author_filter.insert(author.as_slice());
        let mut reader_filter = GrowableBloom::new(1e-6, 4);
        reader_filter.insert(reader.as_slice());

        let sub = Subscription {
            author_filter: Some(author_filter),
            reader_filter: Some(reader_filter),
        };

        let matching = Publication {
            entry_key: Id::ZERO,
            author_public_key: author.clone(),
            reader_public_key: reader.clone(),
        };
        assert!(sub.matches(&matching));

        let wrong_author = Publication {
            entry_key: Id::ZERO,
            author_public_key: other.clone(),
            reader_public_key: reader,
        };
        assert!(!sub.matches(&wrong_author));

        let wrong_reader = Publication {
            entry_key: Id::ZERO,
            author_public_key: author,
            reader_public_key: other,
        };
        assert!(!sub.matches(&wrong_reader));
    }

    #[test]
    fn subscription_survives_serialization() {
        let author = Keypair::generate().public_key_bytes();
        let mut author_filter = GrowableBloom::new(1e-6, 4);
        author_filter.insert(author.as_slice());

        let sub = Subscription {
            author_filter: Some(author_filter),
            reader_filter: None,
        };
        let bytes = serialize(&sub).unwrap();
        let decoded: Subscription = deserialize_bounded(&bytes).unwrap();

        let publication = Publication {
            entry_key: Id::ZERO,
            author_public_key: author,
            reader_public_key: Keypair::generate().public_key_bytes(),
        };
        assert!(decoded.matches(&publication));
    }

    #[test]
    fn response_error_roundtrip() {
        let response = Response::Error {
            metadata: ResponseMetadata::echoing(&test_metadata()),
            kind: ErrorKind::Unauthenticated,
            message: "signature verification failed".to_string(),
        };
        let bytes = serialize(&response).unwrap();
        let decoded: Response = deserialize_bounded(&bytes).unwrap();
        match decoded {
            Response::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Unauthenticated);
                assert_eq!(message, "signature verification failed");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
