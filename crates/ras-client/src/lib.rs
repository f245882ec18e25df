//! Connectivity core of the RAS phone agent.
//!
//! Finds a way to reach the daemon, authenticates it, and decides when an
//! automatic reconnection may run:
//!
//! ```text
//! ReconnectController ─► Orchestrator ─► capability exchange (HTTP probe, relay fallback)
//!                                     ─► strategies: VPN overlay, LAN direct, P2P, relay
//!                                     ─► post-connect auth handshake
//!                                     ─► Transport handed to the session layer
//! ```

pub mod capabilities;
pub mod config;
pub mod credentials;
pub mod helpers;
pub mod orchestrator;
pub mod p2p;
pub mod pairing;
pub mod reconnect;
pub mod signaling;
pub mod transport;
pub mod types;

pub use config::{ClientConfig, ConnectMode};
pub use credentials::{
    CredentialRepository, Credentials, FileCredentialRepository, InMemoryCredentialRepository,
};
pub use orchestrator::{ConnectFailure, ConnectReport, Connected, Orchestrator};
pub use pairing::{PairExchangeResult, PairedIdentity, PairingExchanger, PairingRequest};
pub use reconnect::{
    FileIntentStore, IntentStore, MemoryIntentStore, OrchestratorReconnectService,
    ReconnectController, ReconnectEvent, ReconnectHandle, ReconnectOutcome, ReconnectService,
    ReconnectState, SingleFlight, SkipReason, Trigger,
};
pub use transport::{Transport, TransportError, TransportKind};
pub use types::{ConnectPurpose, ConnectionContext, ConnectionProgress, DaemonHints, ProgressSink};
