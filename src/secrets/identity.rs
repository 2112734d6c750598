//! Asymmetric layer
//!
//! An identity is an X25519 static secret; its recipient is the public key.
//! Payloads are sealed to a recipient with an ephemeral key agreement,
//! HKDF-SHA256 key derivation and XChaCha20-Poly1305, then ASCII-armored.
//!
//! Envelope layout: 32B ephemeral public key, 24B nonce, ciphertext + tag.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::CryptoError;

const IDENTITY_PREFIX: &str = "ADI-SECRET-KEY-";
const RECIPIENT_PREFIX: &str = "adi1";
const WRAP_INFO: &[u8] = b"adi-installer/v1/envelope";

const ARMOR_BEGIN: &str = "-----BEGIN ADI ENCRYPTED FILE-----";
const ARMOR_END: &str = "-----END ADI ENCRYPTED FILE-----";
const ARMOR_WIDTH: usize = 64;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Private half of the key pair
pub struct Identity {
    secret: StaticSecret,
}

/// Public half of the key pair
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    public: PublicKey,
}

fn decode_key(raw: &str, prefix: &str, what: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let invalid = |reason: String| CryptoError::InvalidKey {
        reason: format!("{what}: {reason}"),
    };

    let encoded = raw
        .trim()
        .strip_prefix(prefix)
        .ok_or_else(|| invalid(format!("expected prefix {prefix}")))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| invalid(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| invalid(format!("expected {KEY_LEN} bytes, got {}", b.len())))
}

fn derive_key(
    shared: &[u8],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Key, CryptoError> {
    let mut salt = [0u8; 2 * KEY_LEN];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; KEY_LEN];
    hk.expand(WRAP_INFO, &mut key)
        .map_err(|e| CryptoError::InvalidKey {
            reason: format!("hkdf expand: {e}"),
        })?;
    Ok(*Key::from_slice(&key))
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Parse an `ADI-SECRET-KEY-...` string
    pub fn parse(raw: &str) -> Result<Self, CryptoError> {
        let bytes = decode_key(raw, IDENTITY_PREFIX, "identity")?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    pub fn recipient(&self) -> Recipient {
        Recipient {
            public: PublicKey::from(&self.secret),
        }
    }

    /// Serialized secret key, for writing to the key file only
    pub fn to_secret_string(&self) -> String {
        format!(
            "{}{}",
            IDENTITY_PREFIX,
            URL_SAFE_NO_PAD.encode(self.secret.to_bytes())
        )
    }

    /// Open an armored payload sealed to this identity's recipient
    pub fn decrypt(&self, armored: &str) -> Result<Vec<u8>, CryptoError> {
        let envelope = dearmor(armored)?;
        if envelope.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Armor {
                reason: "envelope too short".to_string(),
            });
        }

        let (eph, rest) = envelope.split_at(KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let mut eph_bytes = [0u8; KEY_LEN];
        eph_bytes.copy_from_slice(eph);
        let eph_public = PublicKey::from(eph_bytes);

        let recipient = self.recipient();
        let shared = self.secret.diffie_hellman(&eph_public);
        let key = derive_key(shared.as_bytes(), &eph_public, &recipient.public)?;

        XChaCha20Poly1305::new(&key)
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: recipient.public.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn decrypt_string(&self, armored: &str) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(armored)?).map_err(|_| CryptoError::Armor {
            reason: "payload is not valid UTF-8".to_string(),
        })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("recipient", &self.recipient().to_string())
            .finish_non_exhaustive()
    }
}

impl FromStr for Identity {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Recipient {
    /// Parse an `adi1...` string
    pub fn parse(raw: &str) -> Result<Self, CryptoError> {
        let bytes = decode_key(raw, RECIPIENT_PREFIX, "recipient")?;
        Ok(Self {
            public: PublicKey::from(bytes),
        })
    }

    /// Seal `plaintext` so only the matching identity can open it
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph_secret);
        let shared = eph_secret.diffie_hellman(&self.public);
        let key = derive_key(shared.as_bytes(), &eph_public, &self.public)?;

        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = XChaCha20Poly1305::new(&key)
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: self.public.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut envelope = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(eph_public.as_bytes());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(armor(&envelope))
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            RECIPIENT_PREFIX,
            URL_SAFE_NO_PAD.encode(self.public.as_bytes())
        )
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recipient({self})")
    }
}

impl FromStr for Recipient {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Wrap bytes in a base64 block with begin/end markers
pub fn armor(bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    let mut out = String::with_capacity(encoded.len() + ARMOR_BEGIN.len() + ARMOR_END.len() + 8);
    out.push_str(ARMOR_BEGIN);
    out.push('\n');
    for chunk in encoded.as_bytes().chunks(ARMOR_WIDTH) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(ARMOR_END);
    out.push('\n');
    out
}

/// Reverse of `armor`
pub fn dearmor(armored: &str) -> Result<Vec<u8>, CryptoError> {
    let body = armored
        .trim()
        .strip_prefix(ARMOR_BEGIN)
        .and_then(|rest| rest.strip_suffix(ARMOR_END))
        .ok_or_else(|| CryptoError::Armor {
            reason: "missing begin/end markers".to_string(),
        })?;

    let joined: String = body.split_whitespace().collect();
    STANDARD.decode(joined).map_err(|e| CryptoError::Armor {
        reason: e.to_string(),
    })
}
