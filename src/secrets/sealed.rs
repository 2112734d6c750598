//! Secret blocks stored in the rendered topology
//!
//! The project block holds the recipient and the wrapped master key. Each
//! service block holds value tokens encrypted with that master key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identity::{Identity, Recipient};
use super::value::ValueCipher;
use crate::error::CryptoError;

/// Project-level `x-secrets` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub recipient: String,
    /// Armored master key sealed to `recipient`
    pub key: String,
}

impl SealedKey {
    /// Generate a master key and wrap it for `recipient`
    pub fn generate(recipient: &Recipient) -> Result<(Self, ValueCipher), CryptoError> {
        let cipher = ValueCipher::generate();
        let sealed = Self::wrap(&cipher, recipient)?;
        Ok((sealed, cipher))
    }

    pub fn wrap(cipher: &ValueCipher, recipient: &Recipient) -> Result<Self, CryptoError> {
        Ok(Self {
            recipient: recipient.to_string(),
            key: recipient.encrypt(cipher.key_bytes())?,
        })
    }

    /// Unwrap the master key
    ///
    /// The identity's recipient must equal the stored recipient; otherwise
    /// this fails before any decryption is attempted.
    pub fn open(&self, identity: &Identity) -> Result<ValueCipher, CryptoError> {
        let actual = identity.recipient().to_string();
        if actual != self.recipient {
            return Err(CryptoError::RecipientMismatch {
                expected: self.recipient.clone(),
                actual,
            });
        }
        let key = identity.decrypt(&self.key)?;
        ValueCipher::from_bytes(&key)
    }

    /// Re-wrap the same master key for a new recipient
    pub fn rewrap(&self, identity: &Identity, recipient: &Recipient) -> Result<Self, CryptoError> {
        let cipher = self.open(identity)?;
        Self::wrap(&cipher, recipient)
    }
}

/// Service-level `x-secrets` block
///
/// `data` values are mounted or exported into the container; `un-mapped`
/// values are only used by the installer itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSecrets {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    #[serde(
        rename = "un-mapped",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub un_mapped: BTreeMap<String, String>,
}

impl ServiceSecrets {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.un_mapped.is_empty()
    }

    /// Encrypt every value, keeping keys
    pub fn seal(&self, cipher: &ValueCipher) -> Result<Self, CryptoError> {
        Ok(Self {
            data: seal_map(&self.data, cipher)?,
            un_mapped: seal_map(&self.un_mapped, cipher)?,
        })
    }

    /// Decrypt every value, keeping keys
    pub fn open(&self, cipher: &ValueCipher) -> Result<Self, CryptoError> {
        Ok(Self {
            data: open_map(&self.data, cipher)?,
            un_mapped: open_map(&self.un_mapped, cipher)?,
        })
    }
}

fn seal_map(
    values: &BTreeMap<String, String>,
    cipher: &ValueCipher,
) -> Result<BTreeMap<String, String>, CryptoError> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), cipher.encrypt_value(v)?)))
        .collect()
}

fn open_map(
    values: &BTreeMap<String, String>,
    cipher: &ValueCipher,
) -> Result<BTreeMap<String, String>, CryptoError> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), cipher.decrypt_value(v)?)))
        .collect()
}
