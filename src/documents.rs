//! # Document Model
//!
//! The network stores opaque signed documents of three kinds:
//!
//! - **Envelope**: addresses an entry for one reader, distributing the entry
//!   encryption key via ECDH between the author and reader keys.
//! - **Entry**: the root of a stored item; holds a single inlined page or an
//!   ordered list of page keys, plus encrypted metadata.
//! - **Page**: a fixed-size chunk of ciphertext with its MAC.
//!
//! Documents are content-addressed: a document's ID is the SHA-256 of its
//! serialized form, and the storage layer refuses any `(key, value)` pair
//! where the two disagree. Envelopes hash over their full serialized form
//! including the reader key, so the same `(author, reader, entry)` triple
//! always yields the same envelope ID.

use bincode::Options;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::Id;
use crate::identity::PUBLIC_KEY_LENGTH;

/// Upper bound on a serialized document. Pages dominate: one page of
/// ciphertext plus MACs and framing.
pub const MAX_DOCUMENT_SIZE: u64 = 2 * 1024 * 1024;

/// Length of an HMAC-SHA256 MAC.
pub const MAC_LENGTH: usize = 32;

/// A stored document: one of the three kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Document {
    Envelope(Envelope),
    Entry(Entry),
    Page(Page),
}

/// Addresses an entry for a single reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub entry_key: Id,
    pub author_public_key: Vec<u8>,
    pub reader_public_key: Vec<u8>,
}

/// A chunk of encrypted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub author_public_key: Vec<u8>,
    pub index: u32,
    pub ciphertext: Vec<u8>,
    pub ciphertext_mac: Vec<u8>,
}

/// The root document of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub author_public_key: Vec<u8>,
    pub contents: EntryContents,
    /// Unix seconds at creation.
    pub created_time: u64,
    pub metadata_ciphertext: Vec<u8>,
    pub metadata_ciphertext_mac: Vec<u8>,
}

/// Single-page entries inline the page; multi-page entries reference the
/// page documents by key, in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryContents {
    Page(Page),
    PageKeys(Vec<Id>),
}

/// Plaintext entry metadata, encrypted into the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub media_type: String,
    pub ciphertext_size: u64,
    pub uncompressed_size: u64,
    pub ciphertext_mac: Vec<u8>,
}

/// What gets announced to the subscription overlay when a fresh envelope is
/// stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub entry_key: Id,
    pub author_public_key: Vec<u8>,
    pub reader_public_key: Vec<u8>,
}

/// A publication together with the envelope key it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedPublication {
    pub key: Id,
    pub value: Publication,
}

/// Structural validation failures for documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// A public key field has the wrong length.
    InvalidPublicKey(usize),
    /// A MAC field has the wrong length.
    InvalidMac(usize),
    /// An entry's page key list is empty.
    EmptyPageKeys,
    /// Metadata ciphertext is missing.
    EmptyMetadata,
    /// Serialization failed or exceeded bounds.
    Encoding(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::InvalidPublicKey(n) => {
                write!(f, "public key must be {} bytes, got {}", PUBLIC_KEY_LENGTH, n)
            }
            DocumentError::InvalidMac(n) => {
                write!(f, "MAC must be {} bytes, got {}", MAC_LENGTH, n)
            }
            DocumentError::EmptyPageKeys => write!(f, "entry has no page keys"),
            DocumentError::EmptyMetadata => write!(f, "entry has no metadata ciphertext"),
            DocumentError::Encoding(msg) => write!(f, "document encoding failed: {}", msg),
        }
    }
}

impl std::error::Error for DocumentError {}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DOCUMENT_SIZE)
        .with_fixint_encoding()
}

impl Document {
    pub fn serialize(&self) -> Result<Vec<u8>, DocumentError> {
        bincode_options()
            .serialize(self)
            .map_err(|e| DocumentError::Encoding(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DocumentError> {
        bincode_options()
            .deserialize(bytes)
            .map_err(|e| DocumentError::Encoding(e.to_string()))
    }

    /// The content address: SHA-256 of the serialized document.
    pub fn id(&self) -> Result<Id, DocumentError> {
        let bytes = self.serialize()?;
        Ok(id_of(&bytes))
    }

    /// Structural validation. Does not verify MACs or signatures; it bounds
    /// field shapes so malformed peer input never panics downstream.
    pub fn check(&self) -> Result<(), DocumentError> {
        match self {
            Document::Envelope(e) => {
                check_public_key(&e.author_public_key)?;
                check_public_key(&e.reader_public_key)
            }
            Document::Page(p) => check_page(p),
            Document::Entry(e) => {
                check_public_key(&e.author_public_key)?;
                if e.metadata_ciphertext.is_empty() {
                    return Err(DocumentError::EmptyMetadata);
                }
                check_mac(&e.metadata_ciphertext_mac)?;
                match &e.contents {
                    EntryContents::Page(p) => check_page(p),
                    EntryContents::PageKeys(keys) => {
                        if keys.is_empty() {
                            return Err(DocumentError::EmptyPageKeys);
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

fn check_page(page: &Page) -> Result<(), DocumentError> {
    check_public_key(&page.author_public_key)?;
    check_mac(&page.ciphertext_mac)
}

fn check_public_key(key: &[u8]) -> Result<(), DocumentError> {
    if key.len() != PUBLIC_KEY_LENGTH {
        return Err(DocumentError::InvalidPublicKey(key.len()));
    }
    Ok(())
}

fn check_mac(mac: &[u8]) -> Result<(), DocumentError> {
    if mac.len() != MAC_LENGTH {
        return Err(DocumentError::InvalidMac(mac.len()));
    }
    Ok(())
}

/// Content address of serialized document bytes.
pub fn id_of(bytes: &[u8]) -> Id {
    Id::from_bytes(Sha256::digest(bytes).into())
}

/// Extract the publication announced by storing `doc` under `key`.
///
/// Only envelopes produce publications.
pub fn publication_from(key: Id, doc: &Document) -> Option<KeyedPublication> {
    match doc {
        Document::Envelope(e) => Some(KeyedPublication {
            key,
            value: Publication {
                entry_key: e.entry_key,
                author_public_key: e.author_public_key.clone(),
                reader_public_key: e.reader_public_key.clone(),
            },
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    pub(crate) fn test_page(author: &[u8], index: u32) -> Page {
        Page {
            author_public_key: author.to_vec(),
            index,
            ciphertext: vec![7u8; 64],
            ciphertext_mac: vec![1u8; MAC_LENGTH],
        }
    }

    fn test_entry(author: &[u8]) -> Entry {
        Entry {
            author_public_key: author.to_vec(),
            contents: EntryContents::Page(test_page(author, 0)),
            created_time: 1_700_000_000,
            metadata_ciphertext: vec![9u8; 48],
            metadata_ciphertext_mac: vec![2u8; MAC_LENGTH],
        }
    }

    #[test]
    fn serialization_roundtrip() {
        let author = Keypair::generate().public_key_bytes();
        let doc = Document::Entry(test_entry(&author));
        let bytes = doc.serialize().unwrap();
        let recovered = Document::deserialize(&bytes).unwrap();
        assert_eq!(doc, recovered);
    }

    #[test]
    fn id_is_hash_of_serialization() {
        let author = Keypair::generate().public_key_bytes();
        let doc = Document::Page(test_page(&author, 3));
        let bytes = doc.serialize().unwrap();
        assert_eq!(doc.id().unwrap(), id_of(&bytes));
    }

    #[test]
    fn id_is_deterministic_and_content_sensitive() {
        let author = Keypair::generate().public_key_bytes();
        let doc = Document::Page(test_page(&author, 0));
        assert_eq!(doc.id().unwrap(), doc.id().unwrap());

        let mut other_page = test_page(&author, 0);
        other_page.ciphertext[0] ^= 1;
        let other = Document::Page(other_page);
        assert_ne!(doc.id().unwrap(), other.id().unwrap());
    }

    #[test]
    fn envelope_id_covers_reader_key() {
        let author = Keypair::generate().public_key_bytes();
        let reader_a = Keypair::generate().public_key_bytes();
        let reader_b = Keypair::generate().public_key_bytes();
        let entry_key = Id::from_bytes([5u8; 32]);

        let env_a = Document::Envelope(Envelope {
            entry_key,
            author_public_key: author.clone(),
            reader_public_key: reader_a.clone(),
        });
        let env_a_again = Document::Envelope(Envelope {
            entry_key,
            author_public_key: author.clone(),
            reader_public_key: reader_a,
        });
        let env_b = Document::Envelope(Envelope {
            entry_key,
            author_public_key: author,
            reader_public_key: reader_b,
        });

        assert_eq!(env_a.id().unwrap(), env_a_again.id().unwrap());
        assert_ne!(env_a.id().unwrap(), env_b.id().unwrap());
    }

    #[test]
    fn check_rejects_bad_public_key() {
        let doc = Document::Envelope(Envelope {
            entry_key: Id::ZERO,
            author_public_key: vec![0u8; 33],
            reader_public_key: vec![0u8; PUBLIC_KEY_LENGTH],
        });
        assert!(matches!(
            doc.check(),
            Err(DocumentError::InvalidPublicKey(33))
        ));
    }

    #[test]
    fn check_rejects_bad_mac_and_empty_fields() {
        let author = Keypair::generate().public_key_bytes();

        let mut page = test_page(&author, 0);
        page.ciphertext_mac = vec![0u8; 16];
        assert!(matches!(
            Document::Page(page).check(),
            Err(DocumentError::InvalidMac(16))
        ));

        let mut entry = test_entry(&author);
        entry.contents = EntryContents::PageKeys(vec![]);
        assert!(matches!(
            Document::Entry(entry).check(),
            Err(DocumentError::EmptyPageKeys)
        ));

        let mut entry = test_entry(&author);
        entry.metadata_ciphertext.clear();
        assert!(matches!(
            Document::Entry(entry).check(),
            Err(DocumentError::EmptyMetadata)
        ));
    }

    #[test]
    fn check_accepts_valid_documents() {
        let author = Keypair::generate().public_key_bytes();
        assert!(Document::Page(test_page(&author, 0)).check().is_ok());
        assert!(Document::Entry(test_entry(&author)).check().is_ok());

        let mut entry = test_entry(&author);
        entry.contents = EntryContents::PageKeys(vec![Id::ZERO, Id::MAX]);
        assert!(Document::Entry(entry).check().is_ok());
    }

    #[test]
    fn publication_extracted_from_envelope_only() {
        let author = Keypair::generate().public_key_bytes();
        let reader = Keypair::generate().public_key_bytes();
        let env = Document::Envelope(Envelope {
            entry_key: Id::from_bytes([4u8; 32]),
            author_public_key: author.clone(),
            reader_public_key: reader.clone(),
        });
        let key = env.id().unwrap();

        let keyed = publication_from(key, &env).expect("envelope publishes");
        assert_eq!(keyed.key, key);
        assert_eq!(keyed.value.entry_key, Id::from_bytes([4u8; 32]));
        assert_eq!(keyed.value.author_public_key, author);
        assert_eq!(keyed.value.reader_public_key, reader);

        let page = Document::Page(test_page(&author, 0));
        assert!(publication_from(key, &page).is_none());
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(Document::deserialize(&[0xFF, 0xFE, 0xFD]).is_err());
        let author = Keypair::generate().public_key_bytes();
        let bytes = Document::Page(test_page(&author, 0)).serialize().unwrap();
        assert!(Document::deserialize(&bytes[..bytes.len() / 2]).is_err());
    }
}
