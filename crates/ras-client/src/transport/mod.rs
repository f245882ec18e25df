//! Established byte channels to the daemon.
//!
//! [`Transport`] is a closed set of variants so the orchestrator can match on
//! the kind without inspecting type names. Every variant offers the same
//! operations: send, receive with a timeout, idempotent close, and stats.

mod auth;
mod channel;
mod close;
mod lan;
mod relay;
mod stats;
mod vpn;

pub use auth::authenticate;
pub use channel::{ChannelTransport, DataChannel};
pub use lan::{lan_url, LanTransport};
pub use relay::RelayDataChannel;
pub use stats::{StatsSnapshot, TransportStats};
pub use vpn::{
    DatagramSocket, SocketFactory, UdpDatagramSocket, UdpSocketFactory, VpnHandshakeConfig,
    VpnTransport,
};

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::signaling::SignalingError;

pub(crate) use close::CloseSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    VpnOverlay,
    LanDirect,
    PeerToPeer,
    Relay,
}

impl TransportKind {
    /// Strategy order: overlay first, relay last.
    pub const PRIORITY: [TransportKind; 4] = [
        TransportKind::VpnOverlay,
        TransportKind::LanDirect,
        TransportKind::PeerToPeer,
        TransportKind::Relay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VpnOverlay => "vpn",
            Self::LanDirect => "lan",
            Self::PeerToPeer => "p2p",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("authentication timed out")]
    AuthTimeout,

    #[error("receive timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

impl From<TransportError> for ras_common::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HandshakeFailed { .. } => ras_common::Error::handshake(err),
            TransportError::AuthRejected(reason) => ras_common::Error::auth(reason),
            TransportError::AuthTimeout | TransportError::Timeout => ras_common::Error::timeout(err),
            TransportError::Io(e) => ras_common::Error::Io(e),
            TransportError::Signaling(e) => e.into(),
            other => ras_common::Error::network(other),
        }
    }
}

/// An established connection to the daemon.
pub enum Transport {
    VpnOverlay(VpnTransport),
    LanDirect(LanTransport),
    PeerToPeer(ChannelTransport),
    Relay(ChannelTransport),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport({})", self.kind())
    }
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::VpnOverlay(_) => TransportKind::VpnOverlay,
            Self::LanDirect(_) => TransportKind::LanDirect,
            Self::PeerToPeer(_) => TransportKind::PeerToPeer,
            Self::Relay(_) => TransportKind::Relay,
        }
    }

    /// Whether the daemon has already been authenticated on this transport.
    pub fn is_authenticated(&self) -> bool {
        match self {
            Self::VpnOverlay(t) => t.is_authenticated(),
            Self::LanDirect(t) => t.is_authenticated(),
            Self::PeerToPeer(t) | Self::Relay(t) => t.is_authenticated(),
        }
    }

    pub(crate) fn mark_authenticated(&self) {
        match self {
            Self::VpnOverlay(t) => t.mark_authenticated(),
            Self::LanDirect(t) => t.mark_authenticated(),
            Self::PeerToPeer(t) | Self::Relay(t) => t.mark_authenticated(),
        }
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            Self::VpnOverlay(t) => t.send(data).await,
            Self::LanDirect(t) => t.send(data).await,
            Self::PeerToPeer(t) | Self::Relay(t) => t.send(data).await,
        }
    }

    /// Next inbound message, or [`TransportError::Timeout`] after `timeout`.
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::VpnOverlay(t) => t.receive(timeout).await,
            Self::LanDirect(t) => t.receive(timeout).await,
            Self::PeerToPeer(t) | Self::Relay(t) => t.receive(timeout).await,
        }
    }

    /// Idempotent.
    pub async fn close(&self) {
        match self {
            Self::VpnOverlay(t) => t.close(),
            Self::LanDirect(t) => t.close().await,
            Self::PeerToPeer(t) | Self::Relay(t) => t.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::VpnOverlay(t) => t.is_closed(),
            Self::LanDirect(t) => t.is_closed(),
            Self::PeerToPeer(t) | Self::Relay(t) => t.is_closed(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        match self {
            Self::VpnOverlay(t) => t.stats(),
            Self::LanDirect(t) => t.stats(),
            Self::PeerToPeer(t) | Self::Relay(t) => t.stats(),
        }
    }
}
