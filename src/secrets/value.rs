//! Symmetric layer: AES-256-GCM over individual secret values
//!
//! Token format is `base64(ciphertext).base64(nonce)` with a fresh 96-bit
//! nonce per value.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::CryptoError;

/// Master key length in bytes
pub const MASTER_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts secret values under one master key
#[derive(Clone)]
pub struct ValueCipher {
    key: [u8; MASTER_KEY_LEN],
}

impl ValueCipher {
    /// Fresh random master key
    pub fn generate() -> Self {
        let generated = Aes256Gcm::generate_key(OsRng);
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(&generated);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; MASTER_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "master key must be {MASTER_KEY_LEN} bytes, got {}",
                    bytes.len()
                ),
            })?;
        Ok(Self { key })
    }

    pub fn key_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.key
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.key.into())
    }

    pub fn encrypt_value(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(format!(
            "{}.{}",
            STANDARD.encode(ciphertext),
            STANDARD.encode(nonce)
        ))
    }

    pub fn decrypt_value(&self, token: &str) -> Result<String, CryptoError> {
        let malformed = |reason: &str| CryptoError::MalformedToken {
            reason: reason.to_string(),
        };

        let (ct, nonce) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| malformed("expected <ciphertext>.<nonce>"))?;
        if nonce.contains('.') {
            return Err(malformed("too many segments"));
        }

        let ciphertext = STANDARD
            .decode(ct)
            .map_err(|_| malformed("ciphertext is not base64"))?;
        let nonce = STANDARD
            .decode(nonce)
            .map_err(|_| malformed("nonce is not base64"))?;
        if nonce.len() != NONCE_LEN {
            return Err(malformed("nonce must be 12 bytes"));
        }

        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| malformed("plaintext is not UTF-8"))
    }
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueCipher(..)")
    }
}
