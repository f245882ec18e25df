//! AES-256-GCM codec for relay signaling payloads.
//!
//! The relay is public and untrusted, so every envelope is sealed before it
//! is published.
//!
//! # Wire Format
//!
//! ```text
//! [12 bytes: random nonce] [ciphertext] [16 bytes: GCM tag]
//! ```
//!
//! Blobs are size-bounded on both sides (at most 64 KiB) so a hostile relay
//! cannot make us allocate or decrypt arbitrarily large payloads.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use crate::secret::DerivedKey;

/// GCM nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// GCM tag length (128 bits).
pub const TAG_LEN: usize = 16;

/// Smallest well-formed blob: nonce and tag around an empty plaintext.
pub const MIN_BLOB_LEN: usize = NONCE_LEN + TAG_LEN;

/// Hard cap on blob size.
pub const MAX_BLOB_LEN: usize = 64 * 1024;

/// Largest plaintext that still fits in [`MAX_BLOB_LEN`].
pub const MAX_PLAINTEXT_LEN: usize = MAX_BLOB_LEN - MIN_BLOB_LEN;

/// Codec errors.
///
/// Decryption failures deliberately carry no detail beyond a static reason:
/// callers must not be able to distinguish a bad tag from a bad nonce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("plaintext too large: {0} bytes")]
    PlaintextTooLarge(usize),

    #[error("encryption failed")]
    EncryptionFailure,

    #[error("decryption failed: {0}")]
    DecryptionFailure(&'static str),
}

/// AES-256-GCM codec bound to one key.
pub struct SignalingCodec {
    cipher: Aes256Gcm,
}

impl SignalingCodec {
    /// Create a codec from a derived key.
    pub fn new(key: &DerivedKey) -> Self {
        Self::from_key_bytes(key.as_bytes())
    }

    /// Create a codec from raw 32-byte key material.
    pub fn from_key_bytes(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&(*key).into()),
        }
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// Returns `nonce || ciphertext || tag`.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CodecError::PlaintextTooLarge(plaintext.len()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::EncryptionFailure)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Open a blob produced by [`encode`](Self::encode).
    pub fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
        if blob.len() < MIN_BLOB_LEN {
            return Err(CodecError::DecryptionFailure("blob too short"));
        }
        if blob.len() > MAX_BLOB_LEN {
            return Err(CodecError::DecryptionFailure("blob too large"));
        }

        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::DecryptionFailure("authentication failed"))
    }

    /// [`encode`](Self::encode) followed by standard base64.
    pub fn encode_base64(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        Ok(general_purpose::STANDARD.encode(self.encode(plaintext)?))
    }

    /// Base64-decode then [`decode`](Self::decode).
    ///
    /// Malformed base64 fails exactly like a too-short blob.
    pub fn decode_base64(&self, encoded: &str) -> Result<Vec<u8>, CodecError> {
        // Cheap bound before decoding anything a hostile relay sent us.
        if encoded.len() > MAX_BLOB_LEN.div_ceil(3) * 4 {
            return Err(CodecError::DecryptionFailure("blob too large"));
        }
        let blob = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| CodecError::DecryptionFailure("blob too short"))?;
        self.decode(&blob)
    }
}

/// Seal `plaintext` under `key`. See [`SignalingCodec::encode`].
pub fn encode(key: &DerivedKey, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    SignalingCodec::new(key).encode(plaintext)
}

/// Open `blob` under `key`. See [`SignalingCodec::decode`].
pub fn decode(key: &DerivedKey, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
    SignalingCodec::new(key).decode(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyPurpose, MasterSecret};

    fn codec() -> SignalingCodec {
        SignalingCodec::new(&MasterSecret::from_bytes([1u8; 32]).derive(KeyPurpose::Signaling))
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec();
        for plaintext in [&b""[..], b"x", b"hello relay", &[0xFFu8; 4096][..]] {
            let blob = codec.encode(plaintext).unwrap();
            assert_eq!(blob.len(), plaintext.len() + MIN_BLOB_LEN);
            assert_eq!(codec.decode(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_freshness() {
        let codec = codec();
        let a = codec.encode(b"same plaintext").unwrap();
        let b = codec.encode(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let codec = codec();
        let mut blob = codec.encode(b"payload").unwrap();
        blob[0] ^= 0x01;
        assert!(matches!(
            codec.decode(&blob),
            Err(CodecError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let codec = codec();
        let mut blob = codec.encode(b"payload").unwrap();
        blob[NONCE_LEN] ^= 0x80;
        assert!(matches!(
            codec.decode(&blob),
            Err(CodecError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let codec = codec();
        let mut blob = codec.encode(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            codec.decode(&blob),
            Err(CodecError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_every_byte_is_authenticated() {
        let codec = codec();
        let blob = codec.encode(b"short message").unwrap();
        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x04;
            assert!(codec.decode(&tampered).is_err(), "byte {} not covered", i);
        }
    }

    #[test]
    fn test_too_short_blob() {
        let codec = codec();
        assert_eq!(
            codec.decode(&[0u8; MIN_BLOB_LEN - 1]),
            Err(CodecError::DecryptionFailure("blob too short"))
        );
        assert!(codec.decode(&[]).is_err());
    }

    #[test]
    fn test_too_large_blob() {
        let codec = codec();
        let blob = vec![0u8; MAX_BLOB_LEN + 1];
        assert_eq!(
            codec.decode(&blob),
            Err(CodecError::DecryptionFailure("blob too large"))
        );
    }

    #[test]
    fn test_plaintext_cap() {
        let codec = codec();
        assert!(codec.encode(&vec![0u8; MAX_PLAINTEXT_LEN]).is_ok());
        assert_eq!(
            codec.encode(&vec![0u8; MAX_PLAINTEXT_LEN + 1]),
            Err(CodecError::PlaintextTooLarge(MAX_PLAINTEXT_LEN + 1))
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = codec().encode(b"payload").unwrap();
        let other =
            SignalingCodec::new(&MasterSecret::from_bytes([2u8; 32]).derive(KeyPurpose::Signaling));
        assert!(other.decode(&blob).is_err());
    }

    #[test]
    fn test_base64_roundtrip_and_malformed() {
        let codec = codec();
        let encoded = codec.encode_base64(b"over ntfy").unwrap();
        assert_eq!(codec.decode_base64(&encoded).unwrap(), b"over ntfy");

        assert_eq!(
            codec.decode_base64("not base64 !!!"),
            Err(CodecError::DecryptionFailure("blob too short"))
        );
        // Valid base64, but far too short to be a blob.
        assert_eq!(
            codec.decode_base64("AAAA"),
            Err(CodecError::DecryptionFailure("blob too short"))
        );
    }
}
