//! # Libri - Peer-to-Peer Content-Addressed Document Network
//!
//! A librarian is one node of the network: it participates in a
//! Kademlia-style DHT keyed by 256-bit identifiers, stores opaque signed
//! documents, and propagates publication notifications through a
//! subscription overlay. Authors encrypt content into content-addressed
//! envelopes, entries, and pages that any node can relay or store without
//! decrypting.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | the `Node` facade: lifecycle and the seven RPC handlers |
//! | `id` | 256-bit identifiers and the XOR metric |
//! | `identity` | secp256k1 keypairs and peer ID derivation |
//! | `peer` | peer records and query-outcome counters |
//! | `routing` | interval-partition Kademlia routing table |
//! | `search` / `introduce` / `store` | the three iterative lookups |
//! | `client` / `rpc` | signed RPC over QUIC, both directions |
//! | `messages` | wire protocol types and bounded codecs |
//! | `documents` | envelope/entry/page model and content addressing |
//! | `storage` | key-value store wrapper and validity checkers |
//! | `subscribe` | publication fan-out and fan-in |
//! | `enc` / `pack` | entry encryption keys and author I/O |
//! | `keychain` | sampling keychains and encrypted bundles |

pub mod client;
pub mod config;
pub mod documents;
pub mod enc;
pub mod id;
pub mod identity;
pub mod introduce;
pub mod keychain;
pub mod messages;
pub mod node;
pub mod pack;
pub mod peer;
pub mod routing;
pub mod rpc;
pub mod search;
pub mod sig;
pub mod storage;
pub mod store;
pub mod subscribe;
pub mod tls;

pub use client::{LibrarianClient, RpcError};
pub use config::Config;
pub use documents::{Document, Entry, Envelope, KeyedPublication, Page, Publication};
pub use id::Id;
pub use identity::Keypair;
pub use messages::{ErrorKind, PutOperation, Subscription};
pub use node::Node;
