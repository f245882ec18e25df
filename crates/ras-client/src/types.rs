use std::net::IpAddr;
use std::time::Duration;

use ras_crypto::{DerivedKey, KeyPurpose};
use tokio::sync::mpsc;

use crate::credentials::Credentials;
use crate::transport::TransportKind;

/// Why a connection is being established. Selects the probe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPurpose {
    Initial,
    Reconnect,
}

/// Where to look for the daemon before capabilities are known.
#[derive(Debug, Clone, Default)]
pub struct DaemonHints {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub overlay_address: Option<IpAddr>,
}

impl DaemonHints {
    /// `http://host:port` for the signed capability probe.
    pub fn probe_base(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let port = self.port?;
        Some(format!("http://{}", crate::helpers::host_port(host, port)))
    }
}

/// Everything one connection attempt needs, derived from stored credentials.
///
/// Holds derived keys only; the master secret is not retained.
pub struct ConnectionContext {
    pub device_id: String,
    pub hints: DaemonHints,
    pub topic: String,
    pub auth_key: DerivedKey,
    pub signaling_key: DerivedKey,
    pub purpose: ConnectPurpose,
    pub progress: ProgressSink,
}

impl ConnectionContext {
    pub fn from_credentials(
        credentials: &Credentials,
        purpose: ConnectPurpose,
        progress: ProgressSink,
    ) -> Self {
        let secret = &credentials.master_secret;
        Self {
            device_id: credentials.device_id.clone(),
            hints: DaemonHints {
                host: credentials.daemon_host.clone(),
                port: credentials.daemon_port,
                overlay_address: credentials.overlay_address,
            },
            topic: secret.topic(),
            auth_key: secret.derive(KeyPurpose::Auth),
            signaling_key: secret.derive(KeyPurpose::Signaling),
            purpose,
            progress,
        }
    }
}

/// Which path produced the daemon's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityPath {
    Direct,
    Relay,
    /// Exchange failed; strategies were planned from stored hints.
    Hints,
}

/// Progress events surfaced to the UI while connecting.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionProgress {
    DiscoveringCapabilities,
    ExchangingCapabilities {
        path: CapabilityPath,
    },
    CapabilitiesExchanged {
        path: CapabilityPath,
        strategies: Vec<TransportKind>,
    },
    StrategyStarted {
        kind: TransportKind,
    },
    Authenticating {
        kind: TransportKind,
    },
    StrategySucceeded {
        kind: TransportKind,
        elapsed: Duration,
    },
    StrategyFailed {
        kind: TransportKind,
        elapsed: Duration,
        reason: String,
    },
    Connected {
        kind: TransportKind,
    },
    Failed {
        reason: String,
    },
}

/// Best-effort progress channel. A missing or closed receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ConnectionProgress>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ConnectionProgress>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ConnectionProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
