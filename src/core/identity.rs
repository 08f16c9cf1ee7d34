//! Cryptographic Identity
//!
//! Each participant is a secp256k1 keypair. The participant id seen on the
//! wire is the hex form of the uncompressed public key, so any verifier can
//! recover the verifying key from the id alone, with no key registry.
//!
//! Signatures are deterministic-nonce ECDSA (RFC 6979) over the SHA-256 of
//! the canonical byte encoding of the signed value.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use thiserror::Error;

use crate::core::hash::sha256;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The secret bytes do not form a valid curve scalar.
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// A participant id did not decode to a valid public key.
    #[error("invalid participant id")]
    InvalidParticipantId,
}

/// A participant's signing identity. Owns the private key; the private key
/// never crosses the engine boundary and is erased on drop.
pub struct Identity {
    secret: SecretKey,
    public: PublicKey,
    participant_id: String,
}

impl Identity {
    /// Generate a fresh identity from the OS entropy source.
    pub fn generate() -> Self {
        let (secret, public) = SECP256K1.generate_keypair(&mut rand::thread_rng());
        Self::from_parts(secret, public)
    }

    /// Build an identity from exact secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| IdentityError::InvalidSecretKey)?;
        let public = secret.public_key(SECP256K1);
        Ok(Self::from_parts(secret, public))
    }

    /// Derive an identity deterministically from arbitrary seed bytes.
    ///
    /// The seed is hashed to the scalar, so any non-degenerate seed works.
    pub fn from_seed(seed: &[u8]) -> Result<Self, IdentityError> {
        Self::from_secret_bytes(&sha256(seed))
    }

    fn from_parts(secret: SecretKey, public: PublicKey) -> Self {
        let participant_id = hex::encode(public.serialize_uncompressed());
        Self {
            secret,
            public,
            participant_id,
        }
    }

    /// The wire name of this participant: hex of the uncompressed public key.
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// The verifying key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Sign a message. The message is hashed with SHA-256 and signed with
    /// deterministic-nonce ECDSA; the result is the hex compact signature.
    pub fn sign(&self, message: &[u8]) -> String {
        let digest = Message::from_digest(sha256(message));
        let signature = SECP256K1.sign_ecdsa(&digest, &self.secret);
        hex::encode(signature.serialize_compact())
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key.
        f.debug_struct("Identity")
            .field("participant_id", &self.participant_id)
            .finish_non_exhaustive()
    }
}

/// Recover the verifying key from a participant id.
pub fn parse_participant_id(id: &str) -> Result<PublicKey, IdentityError> {
    let bytes = hex::decode(id).map_err(|_| IdentityError::InvalidParticipantId)?;
    PublicKey::from_slice(&bytes).map_err(|_| IdentityError::InvalidParticipantId)
}

/// Verify a hex compact signature over a message against a participant id.
///
/// Any malformed id, signature, or digest verifies false rather than
/// erroring; a peer that sends garbage is indistinguishable from a forger.
pub fn verify(participant_id: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(public) = parse_participant_id(participant_id) else {
        return false;
    };
    let Ok(raw) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_compact(&raw) else {
        return false;
    };
    let digest = Message::from_digest(sha256(message));
    SECP256K1.verify_ecdsa(&digest, &signature, &public).is_ok()
}
