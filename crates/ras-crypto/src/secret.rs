//! Secret key material.
//!
//! Both types wipe their bytes when dropped, so every early return, `?` and
//! cancelled future releases key material without a manual cleanup step.
//! Neither type implements `Display`, and `Debug` output is redacted.

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::kdf::{derive_key, signaling_topic, CryptoError, KeyPurpose};
use crate::mac::hmac_sha256_parts;

/// Length of the master secret and of every derived key.
pub const SECRET_LEN: usize = 32;

/// The 32-byte secret shared between phone and daemon at pairing time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; SECRET_LEN]);

impl MasterSecret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy secret bytes out of a slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SECRET_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SECRET_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Parse a hex-encoded secret (as carried in the pairing QR code).
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?,
        );
        Self::from_slice(&bytes)
    }

    /// Generate a fresh random secret using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Derive the key for one purpose.
    pub fn derive(&self, purpose: KeyPurpose) -> DerivedKey {
        // Length is fixed by the type, so derivation cannot fail here.
        match derive_key(&self.0, purpose.as_str()) {
            Ok(key) => key,
            Err(_) => unreachable!("master secret is always {SECRET_LEN} bytes"),
        }
    }

    /// Relay topic for this secret.
    pub fn topic(&self) -> String {
        match signaling_topic(&self.0) {
            Ok(topic) => topic,
            Err(_) => unreachable!("master secret is always {SECRET_LEN} bytes"),
        }
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterSecret(<redacted>)")
    }
}

/// A 32-byte key derived from the master secret for a single purpose.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; SECRET_LEN]);

impl DerivedKey {
    pub(crate) fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// HMAC-SHA256 over the concatenation of `parts`, keyed with this key.
    pub fn sign(&self, parts: &[&[u8]]) -> [u8; 32] {
        hmac_sha256_parts(&self.0, parts)
    }

    /// Hex-encoded HMAC, as placed in headers and JSON frames.
    pub fn sign_hex(&self, parts: &[&[u8]]) -> String {
        hex::encode(self.sign(parts))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey(<redacted>)")
    }
}
