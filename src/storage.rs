//! # Storage Layer
//!
//! A thin abstraction over an embedded byte-level key-value store. The
//! [`Kvdb`] trait is the seam the rest of the node programs against; the
//! production implementation wraps redb.
//!
//! Keys are namespaced by prefix: `server/` for node-local state (identity,
//! routing table) and `documents/` for content-addressed documents. The
//! document store enforces the two validity layers: keys must be exactly
//! 32 bytes, and document values must hash to their key.

use std::path::Path;
use std::sync::{Arc, RwLock};

use redb::{Database, TableDefinition};
use sha2::{Digest, Sha256};

use crate::documents::{Document, DocumentError};
use crate::id::{Id, ID_LENGTH};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("libri");

/// Prefix for node-local server state.
pub const NAMESPACE_SERVER: &[u8] = b"server/";

/// Prefix for stored documents.
pub const NAMESPACE_DOCUMENTS: &[u8] = b"documents/";

/// Storage-layer validation and backend failures.
#[derive(Debug)]
pub enum StorageError {
    /// Key length is not exactly 32 bytes.
    InvalidKeyLength(usize),
    /// The value does not hash to its key.
    HashMismatch,
    /// The value is not a structurally valid document.
    InvalidDocument(DocumentError),
    /// The store has been closed.
    Closed,
    /// The underlying database failed.
    Db(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidKeyLength(n) => {
                write!(f, "key must be {} bytes, got {}", ID_LENGTH, n)
            }
            StorageError::HashMismatch => {
                write!(f, "value hash does not match key")
            }
            StorageError::InvalidDocument(e) => write!(f, "invalid document: {}", e),
            StorageError::Closed => write!(f, "database is closed"),
            StorageError::Db(msg) => write!(f, "database error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<DocumentError> for StorageError {
    fn from(e: DocumentError) -> Self {
        StorageError::InvalidDocument(e)
    }
}

/// The byte-level key-value store collaborator.
pub trait Kvdb: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    /// Gracefully shut the store down; later operations fail with
    /// [`StorageError::Closed`].
    fn close(&self) -> Result<(), StorageError>;
}

/// redb-backed [`Kvdb`].
pub struct RedbStore {
    db: RwLock<Option<Database>>,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(db_err)?;
        // Create the table up front so reads before the first write succeed.
        let txn = db.begin_write().map_err(db_err)?;
        txn.open_table(TABLE).map_err(db_err)?;
        txn.commit().map_err(db_err)?;
        Ok(Self {
            db: RwLock::new(Some(db)),
        })
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self.db.read().expect("database lock poisoned");
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StorageError::Closed),
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Db(e.to_string())
}

impl Kvdb for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(TABLE).map_err(db_err)?;
            let value = table.get(key).map_err(db_err)?;
            Ok(value.map(|guard| guard.value().to_vec()))
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(TABLE).map_err(db_err)?;
                table.insert(key, value).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(TABLE).map_err(db_err)?;
                table.remove(key).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        // Dropping the handle releases the file; closing twice is a no-op.
        self.db.write().expect("database lock poisoned").take();
        Ok(())
    }
}

/// Reject keys that are not exactly 32 bytes.
pub fn check_key(key: &[u8]) -> Result<(), StorageError> {
    if key.len() != ID_LENGTH {
        return Err(StorageError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

/// Reject `(key, value)` pairs where `SHA-256(value) != key`.
pub fn check_key_value(key: &Id, value: &[u8]) -> Result<(), StorageError> {
    check_key(key.as_bytes())?;
    let digest: [u8; ID_LENGTH] = Sha256::digest(value).into();
    if &digest != key.as_bytes() {
        return Err(StorageError::HashMismatch);
    }
    Ok(())
}

fn namespaced(namespace: &[u8], key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(namespace.len() + key.len());
    full.extend_from_slice(namespace);
    full.extend_from_slice(key);
    full
}

/// Store/loader for the `server/` namespace: identity, routing table.
#[derive(Clone)]
pub struct ServerStore {
    db: Arc<dyn Kvdb>,
}

impl ServerStore {
    pub fn new(db: Arc<dyn Kvdb>) -> Self {
        Self { db }
    }

    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.put(&namespaced(NAMESPACE_SERVER, key), value)
    }

    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db.get(&namespaced(NAMESPACE_SERVER, key))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.delete(&namespaced(NAMESPACE_SERVER, key))
    }
}

/// Store/loader for the `documents/` namespace, enforcing content
/// addressing and structural validity in both directions.
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<dyn Kvdb>,
}

impl DocumentStore {
    pub fn new(db: Arc<dyn Kvdb>) -> Self {
        Self { db }
    }

    /// Validate and persist serialized document bytes under `key`.
    pub fn store(&self, key: &Id, value: &[u8]) -> Result<(), StorageError> {
        check_key_value(key, value)?;
        Document::deserialize(value)?.check()?;
        self.db.put(&namespaced(NAMESPACE_DOCUMENTS, key.as_bytes()), value)
    }

    /// Load serialized document bytes, re-verifying the content address.
    pub fn load(&self, key: &Id) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .db
            .get(&namespaced(NAMESPACE_DOCUMENTS, key.as_bytes()))?;
        if let Some(bytes) = &value {
            check_key_value(key, bytes)?;
        }
        Ok(value)
    }

    /// Load and deserialize a document.
    pub fn load_document(&self, key: &Id) -> Result<Option<Document>, StorageError> {
        match self.load(key)? {
            Some(bytes) => Ok(Some(Document::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize, address, validate, and persist a document; returns its key.
    pub fn store_document(&self, doc: &Document) -> Result<Id, StorageError> {
        let bytes = doc.serialize()?;
        let key = crate::documents::id_of(&bytes);
        self.store(&key, &bytes)?;
        Ok(key)
    }
}
