//! Encryption at rest for upstream credentials, plus key hashing.
//!
//! Credentials are sealed with AES-256-GCM under the process-wide key. The
//! stored form is `base64(ciphertext) + "." + base64(tag)` with the random
//! 12-byte nonce kept alongside as `iv = base64(nonce)`. Proxy keys are
//! looked up only by their lowercase-hex SHA-256.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Nonce length in bytes.
const NONCE_LEN: usize = 12;

/// A sealed credential as it is sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedBlob {
    /// `base64(ciphertext) + "." + base64(tag)`
    pub blob: String,
    /// `base64(nonce)`
    pub iv: String,
}

pub struct Crypto {
    cipher: Aes256Gcm,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, GatewayError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::provider("Failed to encrypt credential"))?;

        // aes-gcm appends the tag to the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(EncryptedBlob {
            blob: format!("{}.{}", STANDARD.encode(ciphertext), STANDARD.encode(tag)),
            iv: STANDARD.encode(nonce),
        })
    }

    pub fn decrypt(&self, blob: &str, iv: &str) -> Result<String, GatewayError> {
        let (ciphertext_b64, tag_b64) = blob
            .split_once('.')
            .ok_or_else(|| GatewayError::provider("Malformed encrypted credential"))?;

        let mut sealed = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| GatewayError::provider("Malformed encrypted credential"))?;
        let tag = STANDARD
            .decode(tag_b64)
            .map_err(|_| GatewayError::provider("Malformed encrypted credential"))?;
        sealed.extend_from_slice(&tag);

        let nonce_bytes = STANDARD
            .decode(iv)
            .map_err(|_| GatewayError::provider("Malformed credential nonce"))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(GatewayError::provider("Malformed credential nonce"));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
            .map_err(|_| GatewayError::provider("Failed to decrypt credential"))?;

        String::from_utf8(plaintext)
            .map_err(|_| GatewayError::provider("Decrypted credential is not valid UTF-8"))
    }
}

/// Lowercase-hex SHA-256 of a raw proxy key.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
