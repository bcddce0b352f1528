//! # Request Signatures
//!
//! Every RPC request travels with a compact JWS (`header.claims.signature`,
//! each part base64url without padding) signed by the sender's secp256k1
//! key. The claims carry a single `hash` field: the base64url SHA-256 of
//! the serialized request body, binding the token to exactly one request.
//!
//! Verification yields the caller's peer ID — `SHA-256` of the public key
//! presented in the request metadata — after confirming that the token's
//! signature checks out under that key and that its claimed hash matches
//! the body actually received.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdsa::signature::{Signer as _, Verifier as _};
use k256::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::Id;
use crate::identity::{peer_id_from_public_key, verifying_key_from_public_key, Keypair};

/// Fixed JOSE header for all request tokens.
const JWS_HEADER: &str = r#"{"alg":"ES256K","typ":"JWT"}"#;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    hash: String,
}

/// Verification failure kinds, surfaced to callers as `Unauthenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// No signature accompanied the request.
    MissingSignature,
    /// The token is not well-formed compact JWS.
    MalformedToken,
    /// The public key in the metadata failed to parse.
    InvalidPublicKey,
    /// The token's signature does not verify under the presented key.
    InvalidSignature,
    /// The token's claimed hash differs from the request body.
    SignatureMismatch,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::MissingSignature => write!(f, "request signature is missing"),
            VerifyError::MalformedToken => write!(f, "signature token is malformed"),
            VerifyError::InvalidPublicKey => write!(f, "request public key is invalid"),
            VerifyError::InvalidSignature => write!(f, "signature verification failed"),
            VerifyError::SignatureMismatch => {
                write!(f, "signature does not cover this request")
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// Signs request bodies into compact JWS tokens.
#[derive(Clone)]
pub struct Signer {
    keypair: Keypair,
}

impl Signer {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    /// Produce the signed token for a serialized request body.
    pub fn sign(&self, body: &[u8]) -> String {
        let claims = Claims {
            hash: URL_SAFE_NO_PAD.encode(Sha256::digest(body)),
        };
        let claims_json =
            serde_json::to_string(&claims).expect("claims serialization is infallible");

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWS_HEADER.as_bytes()),
            URL_SAFE_NO_PAD.encode(claims_json.as_bytes()),
        );
        let signature: Signature = self.keypair.signing_key().sign(signing_input.as_bytes());
        format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}

/// Verifies request tokens against bodies and public keys.
pub trait RequestVerifier: Send + Sync {
    /// Check `token` against `public_key` and `body`; on success return the
    /// caller's derived peer ID.
    fn verify(&self, token: &str, public_key: &[u8], body: &[u8]) -> Result<Id, VerifyError>;
}

/// The production verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcdsaVerifier;

impl RequestVerifier for EcdsaVerifier {
    fn verify(&self, token: &str, public_key: &[u8], body: &[u8]) -> Result<Id, VerifyError> {
        if token.is_empty() {
            return Err(VerifyError::MissingSignature);
        }

        let mut parts = token.split('.');
        let (header_b64, claims_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(c), Some(s), None) => (h, c, s),
                _ => return Err(VerifyError::MalformedToken),
            };

        let verifying_key = verifying_key_from_public_key(public_key)
            .map_err(|_| VerifyError::InvalidPublicKey)?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| VerifyError::MalformedToken)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| VerifyError::MalformedToken)?;

        let signing_input = format!("{}.{}", header_b64, claims_b64);
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| VerifyError::MalformedToken)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|_| VerifyError::MalformedToken)?;

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(body));
        if claims.hash != expected {
            return Err(VerifyError::SignatureMismatch);
        }

        peer_id_from_public_key(public_key).map_err(|_| VerifyError::InvalidPublicKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keypair = Keypair::generate();
        let signer = Signer::new(keypair.clone());
        let body = b"serialized request body";

        let token = signer.sign(body);
        let peer_id = EcdsaVerifier
            .verify(&token, &keypair.public_key_bytes(), body)
            .expect("valid token should verify");
        assert_eq!(peer_id, keypair.peer_id());
    }

    #[test]
    fn empty_token_is_missing_signature() {
        let keypair = Keypair::generate();
        assert_eq!(
            EcdsaVerifier.verify("", &keypair.public_key_bytes(), b"body"),
            Err(VerifyError::MissingSignature)
        );
    }

    #[test]
    fn wrong_body_is_signature_mismatch() {
        let keypair = Keypair::generate();
        let signer = Signer::new(keypair.clone());
        let token = signer.sign(b"original body");

        assert_eq!(
            EcdsaVerifier.verify(&token, &keypair.public_key_bytes(), b"different body"),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn wrong_key_is_invalid_signature() {
        let signer = Signer::new(Keypair::generate());
        let other = Keypair::generate();
        let token = signer.sign(b"body");

        assert_eq!(
            EcdsaVerifier.verify(&token, &other.public_key_bytes(), b"body"),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn corrupted_public_key_rejected() {
        let keypair = Keypair::generate();
        let signer = Signer::new(keypair.clone());
        let token = signer.sign(b"body");

        let mut corrupted = keypair.public_key_bytes();
        corrupted[0] ^= 0xFF;
        let result = EcdsaVerifier.verify(&token, &corrupted, b"body");
        assert!(matches!(
            result,
            Err(VerifyError::InvalidPublicKey) | Err(VerifyError::InvalidSignature)
        ));

        assert_eq!(
            EcdsaVerifier.verify(&token, &[0u8; 10], b"body"),
            Err(VerifyError::InvalidPublicKey)
        );
    }

    #[test]
    fn malformed_tokens_rejected() {
        let keypair = Keypair::generate();
        let public_key = keypair.public_key_bytes();

        for token in ["not-a-jws", "a.b", "a.b.c.d", "!!.??.##"] {
            assert_eq!(
                EcdsaVerifier.verify(token, &public_key, b"body"),
                Err(VerifyError::MalformedToken),
                "token {:?} should be malformed",
                token
            );
        }
    }

    #[test]
    fn tampered_signature_rejected() {
        let keypair = Keypair::generate();
        let signer = Signer::new(keypair.clone());
        let token = signer.sign(b"body");

        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        let mut sig = URL_SAFE_NO_PAD.decode(&parts[2]).unwrap();
        sig[0] ^= 1;
        parts[2] = URL_SAFE_NO_PAD.encode(&sig);
        let tampered = parts.join(".");

        let result = EcdsaVerifier.verify(&tampered, &keypair.public_key_bytes(), b"body");
        assert!(matches!(
            result,
            Err(VerifyError::InvalidSignature) | Err(VerifyError::MalformedToken)
        ));
    }

    #[test]
    fn verify_binds_peer_id_to_key() {
        // The derived ID is the hash of whichever key verified the token,
        // so a claimed ID can always be cross-checked against it.
        let keypair = Keypair::generate();
        let signer = Signer::new(keypair.clone());
        let token = signer.sign(b"body");

        let peer_id = EcdsaVerifier
            .verify(&token, &keypair.public_key_bytes(), b"body")
            .unwrap();
        assert_eq!(
            peer_id,
            peer_id_from_public_key(&keypair.public_key_bytes()).unwrap()
        );
    }
}
