//! # Keychains
//!
//! Authors hold two keychains: author keys to sign under and self-reader
//! keys to address envelopes to themselves. Envelope creation samples one
//! key from each, so documents spread across the author's key space.
//!
//! Keychains persist as passphrase-encrypted bundles: Argon2id stretches
//! the passphrase into an AES-256-GCM key, and the file layout is
//! `magic || salt || nonce || ciphertext`.

use std::io::{Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use crate::enc::EekKeys;
use crate::identity::Keypair;

/// File magic for encrypted keychain bundles.
const BUNDLE_MAGIC: &[u8; 8] = b"LIBRIKC1";

const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;

const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;

/// Keychain failures.
#[derive(Debug)]
pub enum KeychainError {
    /// The keychain holds no keys to sample.
    Empty,
    /// The bundle file is not a keychain bundle.
    InvalidBundle,
    /// The passphrase is wrong or the bundle is corrupted.
    DecryptionFailed,
    Io(std::io::Error),
}

impl std::fmt::Display for KeychainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeychainError::Empty => write!(f, "keychain is empty"),
            KeychainError::InvalidBundle => write!(f, "not a keychain bundle"),
            KeychainError::DecryptionFailed => {
                write!(f, "wrong passphrase or corrupted bundle")
            }
            KeychainError::Io(e) => write!(f, "keychain IO failed: {}", e),
        }
    }
}

impl std::error::Error for KeychainError {}

impl From<std::io::Error> for KeychainError {
    fn from(e: std::io::Error) -> Self {
        KeychainError::Io(e)
    }
}

/// A set of keypairs sampled uniformly per use.
pub struct Keychain {
    keys: Vec<Keypair>,
}

impl Keychain {
    /// Generate a keychain of `n` fresh keypairs.
    pub fn generate(n: usize) -> Self {
        Self {
            keys: (0..n.max(1)).map(|_| Keypair::generate()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sample one keypair uniformly.
    pub fn sample<R: rand::Rng>(&self, rng: &mut R) -> Result<&Keypair, KeychainError> {
        if self.keys.is_empty() {
            return Err(KeychainError::Empty);
        }
        Ok(&self.keys[rng.gen_range(0..self.keys.len())])
    }

    /// Write the passphrase-encrypted bundle to `path`.
    pub fn save(&self, path: impl AsRef<Path>, passphrase: &str) -> Result<(), KeychainError> {
        let secrets: Vec<[u8; 32]> = self.keys.iter().map(Keypair::secret_bytes).collect();
        let plaintext =
            bincode::serialize(&secrets).map_err(|_| KeychainError::InvalidBundle)?;

        let mut salt = [0u8; SALT_LENGTH];
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = stretch_passphrase(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| KeychainError::DecryptionFailed)?;

        let mut file = std::fs::File::create(path)?;
        file.write_all(BUNDLE_MAGIC)?;
        file.write_all(&salt)?;
        file.write_all(&nonce)?;
        file.write_all(&ciphertext)?;
        Ok(())
    }

    /// Load a passphrase-encrypted bundle from `path`.
    pub fn load(path: impl AsRef<Path>, passphrase: &str) -> Result<Self, KeychainError> {
        let mut bytes = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut bytes)?;

        let header_len = BUNDLE_MAGIC.len() + SALT_LENGTH + NONCE_LENGTH;
        if bytes.len() < header_len || &bytes[..BUNDLE_MAGIC.len()] != BUNDLE_MAGIC {
            return Err(KeychainError::InvalidBundle);
        }
        let salt = &bytes[BUNDLE_MAGIC.len()..BUNDLE_MAGIC.len() + SALT_LENGTH];
        let nonce =
            &bytes[BUNDLE_MAGIC.len() + SALT_LENGTH..header_len];
        let ciphertext = &bytes[header_len..];

        let key = stretch_passphrase(passphrase, salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeychainError::DecryptionFailed)?;

        let secrets: Vec<[u8; 32]> =
            bincode::deserialize(&plaintext).map_err(|_| KeychainError::InvalidBundle)?;
        let keys = secrets
            .iter()
            .map(Keypair::from_secret_bytes)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| KeychainError::InvalidBundle)?;
        if keys.is_empty() {
            return Err(KeychainError::Empty);
        }
        Ok(Self { keys })
    }
}

fn stretch_passphrase(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], KeychainError> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_PARALLELISM, Some(32))
        .map_err(|_| KeychainError::InvalidBundle)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|_| KeychainError::DecryptionFailed)?;
    Ok(key)
}

/// Samples an (author, self-reader) key pair and derives their shared EEK,
/// the starting point for packing a new document.
pub struct EnvelopeKeySampler {
    author_keys: Keychain,
    self_reader_keys: Keychain,
}

impl EnvelopeKeySampler {
    pub fn new(author_keys: Keychain, self_reader_keys: Keychain) -> Self {
        Self {
            author_keys,
            self_reader_keys,
        }
    }

    /// Returns `(author_pub, reader_pub, keys)` for one new envelope.
    pub fn sample<R: rand::Rng>(
        &self,
        rng: &mut R,
    ) -> Result<(Vec<u8>, Vec<u8>, EekKeys), KeychainError> {
        let author = self.author_keys.sample(rng)?;
        let reader = self.self_reader_keys.sample(rng)?;
        let reader_pub = reader.public_key_bytes();
        let keys = EekKeys::derive(author, &reader_pub)
            .map_err(|_| KeychainError::InvalidBundle)?;
        Ok((author.public_key_bytes(), reader_pub, keys))
    }
}
