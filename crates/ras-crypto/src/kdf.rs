//! Key derivation using HKDF-SHA256.
//!
//! Every key is derived from the master secret with a distinct `info` label,
//! so keys for different purposes are independent of each other.

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

use crate::secret::{DerivedKey, SECRET_LEN};

/// Prefix mixed into every HKDF `info` label.
const DERIVATION_DOMAIN: &str = "ras-v1:";

/// Prefix of every relay topic.
pub const TOPIC_PREFIX: &str = "ras-";

/// Number of derived bytes rendered (as hex) into a topic.
const TOPIC_BYTES: usize = 12;

/// Errors from key handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("key derivation failed")]
    Derivation,
}

/// Purposes a key can be derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// HMAC proofs: pairing, probe signatures, transport authentication.
    Auth,
    /// Data-plane encryption.
    Encrypt,
    /// AEAD key for relay signaling envelopes.
    Signaling,
    /// Relay topic derivation.
    Ntfy,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Encrypt => "encrypt",
            Self::Signaling => "signaling",
            Self::Ntfy => "ntfy",
        }
    }
}

/// Derive a 32-byte key for `purpose` from `secret`.
///
/// Pure and deterministic. Fails with [`CryptoError::InvalidKeyLength`] unless
/// `secret` is exactly 32 bytes.
pub fn derive_key(secret: &[u8], purpose: &str) -> Result<DerivedKey, CryptoError> {
    if secret.len() != SECRET_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: SECRET_LEN,
            actual: secret.len(),
        });
    }

    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut info = Vec::with_capacity(DERIVATION_DOMAIN.len() + purpose.len());
    info.extend_from_slice(DERIVATION_DOMAIN.as_bytes());
    info.extend_from_slice(purpose.as_bytes());

    let mut okm = [0u8; SECRET_LEN];
    hkdf.expand(&info, &mut okm)
        .map_err(|_| CryptoError::Derivation)?;
    let key = DerivedKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Relay topic for a master secret.
///
/// Deterministic, fixed length (`ras-` + 24 hex chars) and safe to publish:
/// it is derived through HKDF, so it reveals nothing about the secret.
pub fn signaling_topic(secret: &[u8]) -> Result<String, CryptoError> {
    let key = derive_key(secret, KeyPurpose::Ntfy.as_str())?;
    Ok(format!(
        "{}{}",
        TOPIC_PREFIX,
        hex::encode(&key.as_bytes()[..TOPIC_BYTES])
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let secret = [42u8; 32];
        let a = derive_key(&secret, "auth").unwrap();
        let b = derive_key(&secret, "auth").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_purposes_are_domain_separated() {
        for seed in [0u8, 1, 0x7f, 0xff] {
            let secret = [seed; 32];
            let auth = derive_key(&secret, "auth").unwrap();
            let encrypt = derive_key(&secret, "encrypt").unwrap();
            let signaling = derive_key(&secret, "signaling").unwrap();
            let ntfy = derive_key(&secret, "ntfy").unwrap();

            assert_ne!(auth.as_bytes(), encrypt.as_bytes());
            assert_ne!(auth.as_bytes(), signaling.as_bytes());
            assert_ne!(encrypt.as_bytes(), signaling.as_bytes());
            assert_ne!(signaling.as_bytes(), ntfy.as_bytes());
        }
    }

    #[test]
    fn test_derived_key_differs_from_secret() {
        let secret = [9u8; 32];
        let key = derive_key(&secret, "auth").unwrap();
        assert_ne!(key.as_bytes(), &secret);
    }

    #[test]
    fn test_invalid_key_length() {
        assert_eq!(
            derive_key(&[0u8; 16], "auth").unwrap_err(),
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        );
        assert!(derive_key(&[], "auth").is_err());
        assert!(derive_key(&[0u8; 64], "auth").is_err());
    }

    #[test]
    fn test_topic_is_stable_and_fixed_length() {
        let secret = [3u8; 32];
        let t1 = signaling_topic(&secret).unwrap();
        let t2 = signaling_topic(&secret).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t1.len(), TOPIC_PREFIX.len() + TOPIC_BYTES * 2);
        assert!(t1.starts_with(TOPIC_PREFIX));
        assert!(t1[TOPIC_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));

        let other = signaling_topic(&[4u8; 32]).unwrap();
        assert_ne!(t1, other);
    }

    #[test]
    fn test_topic_does_not_leak_secret_prefix() {
        let secret = [0xAAu8; 32];
        let topic = signaling_topic(&secret).unwrap();
        assert!(!topic.contains("aaaaaaaa"));
    }
}
