//! Relay signaling: a public pub/sub relay carrying AEAD-sealed envelopes.
//!
//! # Architecture
//!
//! ```text
//! SecureSignaling ──seal/open──► SignalingCodec (AES-256-GCM, signaling key)
//!        │
//!        ├──publish/subscribe──► SignalingRelay (ntfy over HTTPS/WSS, or in-memory)
//!        └──validate──────────► SignalValidator (type, session, window, replay)
//! ```

mod channel;
mod memory;
mod relay;
mod validator;

pub use channel::SecureSignaling;
pub use memory::MemoryRelay;
pub use relay::{
    backoff_delay, parse_relay_event, NtfyRelay, RelaySettings, SignalingRelay, Subscription,
    SubscriptionEvent,
};
pub use validator::{ReplayCache, SharedReplayCache, SignalValidator, ValidationError};

use ras_crypto::CodecError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("subscription closed")]
    Closed,

    #[error("timed out waiting for relay")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl From<SignalingError> for ras_common::Error {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Timeout => ras_common::Error::timeout("relay"),
            SignalingError::InvalidUrl(msg) => ras_common::Error::config(msg),
            SignalingError::Codec(e) => ras_common::Error::auth(e),
            SignalingError::Malformed(msg) => ras_common::Error::serialization(msg),
            other => ras_common::Error::network(other),
        }
    }
}
