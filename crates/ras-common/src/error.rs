//! Common error types for RAS.
//!
//! Component crates keep their own narrow error enums and convert into this
//! taxonomy at the orchestration boundary. Messages must never contain key
//! material, proofs, or decrypted payloads.

use thiserror::Error;

/// Result type alias using the RAS error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for connection and pairing operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No paired credentials are stored on this device.
    #[error("no credentials stored")]
    NoCredentials,

    /// The daemon does not know this device; the user must pair again.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// An HMAC, AEAD tag, or challenge did not verify.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Every transport strategy failed; safe to retry later.
    #[error("network error: {0}")]
    Network(String),

    /// A transport-level handshake exhausted its retries.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A bounded wait expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error (socket, file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything else; always logged with context by the caller.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Create a device-not-found error from any displayable type.
    pub fn device_not_found(msg: impl std::fmt::Display) -> Self {
        Self::DeviceNotFound(msg.to_string())
    }

    /// Create an authentication error from any displayable type.
    pub fn auth(msg: impl std::fmt::Display) -> Self {
        Self::AuthenticationFailed(msg.to_string())
    }

    /// Create a network error from any displayable type.
    pub fn network(msg: impl std::fmt::Display) -> Self {
        Self::Network(msg.to_string())
    }

    /// Create a handshake error from any displayable type.
    pub fn handshake(msg: impl std::fmt::Display) -> Self {
        Self::HandshakeFailed(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an unknown error from any displayable type.
    pub fn unknown(msg: impl std::fmt::Display) -> Self {
        Self::Unknown(msg.to_string())
    }

    /// Whether retrying later with the same credentials can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::HandshakeFailed(_) | Self::Timeout(_) | Self::Io(_)
        )
    }

    /// Whether the user should be sent back through pairing.
    pub fn requires_repairing(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_) | Self::AuthenticationFailed(_))
    }

    /// Short stable label for diagnostics and progress events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCredentials => "no_credentials",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Network(_) => "network",
            Self::HandshakeFailed(_) => "handshake_failed",
            Self::Timeout(_) => "timeout",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::serialization(err)
    }
}
