//! Secure Channel
//!
//! ECDH pairing (X25519) and per-message authenticated encryption
//! (AES-256-GCM). Each message is sealed independently under a fresh random
//! nonce; a failed authentication tag surfaces as [`CryptoError::Decrypt`]
//! and the message never reaches the application layer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::SystemRandom;
use ring::{agreement, digest};
use thiserror::Error;

/// Domain separation label for session key derivation.
const KEY_DERIVATION_LABEL: &[u8] = b"dictalink-session-v1";

const NONCE_LEN: usize = 12;

/// Errors from key agreement or message sealing.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to generate keypair")]
    KeyGeneration,
    #[error("peer public key invalid: {0}")]
    InvalidPeerKey(&'static str),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (authentication tag mismatch)")]
    Decrypt,
}

/// 32-byte shared secret produced by key agreement.
///
/// Stored (base64) in the paired peer record so reconnections can skip the
/// exchange and reauthenticate silently.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidPeerKey("not base64"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPeerKey("expected 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("SharedSecret(..)")
    }
}

/// One-shot X25519 keypair for a pairing exchange.
///
/// The private half is consumed by [`EcdhKeypair::agree_base64`]; grab the
/// public key first when building the pairing request.
pub struct EcdhKeypair {
    private: agreement::EphemeralPrivateKey,
    public: Vec<u8>,
}

impl EcdhKeypair {
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|_| CryptoError::KeyGeneration)?;
        let public = private
            .compute_public_key()
            .map_err(|_| CryptoError::KeyGeneration)?
            .as_ref()
            .to_vec();
        Ok(Self { private, public })
    }

    /// Our public key, base64 for the pairing request payload.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(&self.public)
    }

    /// Complete the exchange with the peer's public key (base64).
    pub fn agree_base64(self, peer_public_b64: &str) -> Result<SharedSecret, CryptoError> {
        let peer_bytes = BASE64
            .decode(peer_public_b64)
            .map_err(|_| CryptoError::InvalidPeerKey("not base64"))?;
        let peer_key = agreement::UnparsedPublicKey::new(&agreement::X25519, peer_bytes);
        agreement::agree_ephemeral(self.private, &peer_key, |material| {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(material);
            SharedSecret(secret)
        })
        .map_err(|_| CryptoError::InvalidPeerKey("agreement failed"))
    }
}

/// Symmetric context for one paired link: seals and opens message payloads.
pub struct CipherContext {
    key: LessSafeKey,
}

impl CipherContext {
    /// Derive the 256-bit session key from the shared secret.
    pub fn from_shared_secret(secret: &SharedSecret) -> Result<Self, CryptoError> {
        let mut material = Vec::with_capacity(KEY_DERIVATION_LABEL.len() + 32);
        material.extend_from_slice(KEY_DERIVATION_LABEL);
        material.extend_from_slice(&secret.0);
        let derived = digest::digest(&digest::SHA256, &material);

        let unbound = UnboundKey::new(&aead::AES_256_GCM, derived.as_ref())
            .map_err(|_| CryptoError::KeyGeneration)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Seal a payload: output is `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Open a sealed payload, authenticating the tag.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + aead::AES_256_GCM.tag_len() {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Decrypt)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(plaintext.to_vec())
    }
}
