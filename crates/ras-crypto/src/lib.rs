//! Cryptographic primitives for RAS.
//!
//! This crate provides:
//! - Zero-on-drop secret types for the pairing master secret and derived keys
//! - HKDF-SHA256 key derivation, domain-separated by purpose string
//! - HMAC-SHA256 proofs with constant-time verification
//! - The AES-256-GCM codec that shields signaling payloads from the public relay
//!
//! # Design
//!
//! The 32-byte master secret is shared out-of-band (QR code) and never leaves
//! the device. Everything that crosses the wire is derived from it:
//!
//! ```text
//! master ──HKDF("auth")──────► HMAC proofs (pairing, probe signatures, auth handshake)
//!        ──HKDF("signaling")─► AEAD key for relay envelopes
//!        ──HKDF("ntfy")──────► relay topic (public address, not secret)
//! ```

#![forbid(unsafe_code)]

pub mod aead;
pub mod kdf;
pub mod mac;
pub mod secret;

pub use aead::{CodecError, SignalingCodec};
pub use kdf::{derive_key, signaling_topic, CryptoError, KeyPurpose};
pub use mac::{constant_time_eq, hmac_sha256, hmac_sha256_parts, verify_hmac};
pub use secret::{DerivedKey, MasterSecret, SECRET_LEN};
