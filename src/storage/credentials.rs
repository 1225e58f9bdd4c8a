//! Credential encryption at rest.
//!
//! Tokens are stored as `base64(nonce || ciphertext)` produced by AES-256-GCM.
//! The sync engine only sees the [`CredentialCodec`] trait; key management is
//! the host's concern.

use base64::{engine::general_purpose::STANDARD, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Errors from encrypting or decrypting credential material.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Encrypts and decrypts credential material.
pub trait CredentialCodec: Send + Sync {
    /// Encrypts a plaintext secret.
    fn encrypt(&self, plaintext: &str) -> Result<String, CodecError>;

    /// Decrypts a value produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, ciphertext: &str) -> Result<String, CodecError>;
}

/// AES-256-GCM credential codec.
pub struct AesGcmCodec {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCodec {
    /// Key length in bytes.
    pub const KEY_LEN: usize = 32;

    /// Creates a codec from a raw 32-byte key.
    pub fn new(key: [u8; Self::KEY_LEN]) -> Result<Self, CodecError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &key)
            .map_err(|_| CodecError::InvalidKey("AES-256-GCM key rejected".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Creates a codec from a 64-character hex key.
    pub fn from_hex(hex: &str) -> Result<Self, CodecError> {
        let hex = hex.trim();
        if hex.len() != Self::KEY_LEN * 2 {
            return Err(CodecError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                Self::KEY_LEN * 2,
                hex.len()
            )));
        }

        let mut key = [0u8; Self::KEY_LEN];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| CodecError::InvalidKey("non-ascii key".to_string()))?;
            key[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| CodecError::InvalidKey(format!("invalid hex pair {pair:?}")))?;
        }
        Self::new(key)
    }
}

impl std::fmt::Debug for AesGcmCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCodec").finish_non_exhaustive()
    }
}

impl CredentialCodec for AesGcmCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CodecError::Encrypt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CodecError::Encrypt)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);
        Ok(STANDARD.encode(envelope))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CodecError> {
        let envelope = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| CodecError::Decrypt(format!("base64: {e}")))?;
        if envelope.len() <= NONCE_LEN {
            return Err(CodecError::Decrypt("envelope too short".to_string()));
        }

        let (nonce_bytes, sealed) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CodecError::Decrypt("bad nonce".to_string()))?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CodecError::Decrypt("authentication tag mismatch".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| CodecError::Decrypt(format!("utf-8: {e}")))
    }
}
