//! # Node Identity
//!
//! A librarian's identity is an ECDSA keypair on secp256k1. The node's
//! 256-bit [`Id`] is `SHA-256(pubkey.X || pubkey.Y)` over the uncompressed
//! curve point coordinates, so possession of the private key proves
//! ownership of the ID and every request the node signs is bound to it.
//!
//! Public keys travel on the wire as the raw 64-byte `X || Y` concatenation.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::id::Id;

/// Wire length of a public key: the `X || Y` coordinates, 32 bytes each.
pub const PUBLIC_KEY_LENGTH: usize = 64;

/// Error for malformed or mismatched public key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Public key bytes were not exactly 64 bytes.
    InvalidLength(usize),
    /// Coordinates do not describe a point on the curve.
    InvalidPoint,
    /// Secret bytes do not describe a valid scalar.
    InvalidSecret,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::InvalidLength(n) => {
                write!(f, "public key must be {} bytes, got {}", PUBLIC_KEY_LENGTH, n)
            }
            KeyError::InvalidPoint => write!(f, "public key is not a valid curve point"),
            KeyError::InvalidSecret => write!(f, "secret key is not a valid scalar"),
        }
    }
}

impl std::error::Error for KeyError {}

/// An ECDSA secp256k1 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecret)?;
        Ok(Self { signing_key })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// The raw `X || Y` public key coordinates.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut out = Vec::with_capacity(PUBLIC_KEY_LENGTH);
        out.extend_from_slice(point.x().expect("uncompressed point has x"));
        out.extend_from_slice(point.y().expect("uncompressed point has y"));
        out
    }

    /// The node ID derived from this keypair's public key.
    pub fn peer_id(&self) -> Id {
        peer_id_from_public_key(&self.public_key_bytes())
            .expect("own public key is well-formed")
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Derive the peer ID from 64-byte `X || Y` public key coordinates.
pub fn peer_id_from_public_key(public_key: &[u8]) -> Result<Id, KeyError> {
    if public_key.len() != PUBLIC_KEY_LENGTH {
        return Err(KeyError::InvalidLength(public_key.len()));
    }
    let digest = Sha256::digest(public_key);
    Ok(Id::from_bytes(digest.into()))
}

/// Parse 64-byte `X || Y` coordinates into a verifying key.
pub fn verifying_key_from_public_key(public_key: &[u8]) -> Result<VerifyingKey, KeyError> {
    if public_key.len() != PUBLIC_KEY_LENGTH {
        return Err(KeyError::InvalidLength(public_key.len()));
    }
    let mut sec1 = Vec::with_capacity(1 + PUBLIC_KEY_LENGTH);
    sec1.push(0x04);
    sec1.extend_from_slice(public_key);
    VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| KeyError::InvalidPoint)
}
