//! Connection orchestration.
//!
//! ```text
//! discover local ─► exchange capabilities ─► plan strategies ─► attempt ─► authenticate
//!                        │ 404/401                                 │ fail
//!                        └─► DeviceNotFound / AuthenticationFailed └─► next strategy
//! ```
//!
//! Strategy failures are recorded in the [`ConnectReport`] and never abort
//! the run on their own; only exhausting every strategy does.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use ras_common::{CapabilitiesResponse, Error};
use thiserror::Error as ThisError;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::capabilities::{
    exchange_capabilities, plan_strategies, Availability, CapabilityError, HttpProbe,
    LocalCapabilities, StrategyPlan,
};
use crate::config::{ClientConfig, ConnectMode};
use crate::helpers::new_session_id;
use crate::p2p::{NatType, PeerToPeerConnector, PeerToPeerContext};
use crate::signaling::{SecureSignaling, SignalingRelay};
use crate::transport::{
    authenticate, ChannelTransport, LanTransport, RelayDataChannel, SocketFactory, Transport,
    TransportError, TransportKind, UdpSocketFactory, VpnHandshakeConfig, VpnTransport,
};
use crate::types::{CapabilityPath, ConnectionContext, ConnectionProgress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Connected,
    Failed { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub kind: TransportKind,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

/// Diagnostics for one `connect` call.
#[derive(Debug, Clone, Default)]
pub struct ConnectReport {
    pub capability_path: Option<CapabilityPath>,
    /// Why the exchange fell back to stored hints, if it did.
    pub capability_error: Option<String>,
    pub attempts: Vec<StrategyAttempt>,
    pub total: Duration,
}

impl ConnectReport {
    pub fn attempted(&self) -> Vec<TransportKind> {
        self.attempts.iter().map(|a| a.kind).collect()
    }
}

#[derive(Debug)]
pub struct Connected {
    pub transport: Transport,
    pub capabilities: CapabilitiesResponse,
    pub report: ConnectReport,
}

#[derive(Debug, ThisError)]
#[error("{error}")]
pub struct ConnectFailure {
    pub error: Error,
    pub report: ConnectReport,
}

impl From<ConnectFailure> for Error {
    fn from(failure: ConnectFailure) -> Self {
        failure.error
    }
}

pub struct Orchestrator {
    config: ClientConfig,
    probe: HttpProbe,
    sockets: Arc<dyn SocketFactory>,
    relay: Option<Arc<dyn SignalingRelay>>,
    peer_to_peer: Option<Arc<dyn PeerToPeerConnector>>,
    local: Option<LocalCapabilities>,
}

impl Orchestrator {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            probe: HttpProbe::new(config.probe_timeout),
            config,
            sockets: Arc::new(UdpSocketFactory),
            relay: None,
            peer_to_peer: None,
            local: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn SignalingRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_socket_factory(mut self, sockets: Arc<dyn SocketFactory>) -> Self {
        self.sockets = sockets;
        self
    }

    pub fn with_peer_to_peer(mut self, connector: Arc<dyn PeerToPeerConnector>) -> Self {
        self.peer_to_peer = Some(connector);
        self
    }

    /// Skip interface discovery and use `local` as-is.
    pub fn with_local_capabilities(mut self, local: LocalCapabilities) -> Self {
        self.local = Some(local);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn connect(&self, ctx: ConnectionContext) -> Result<Connected, ConnectFailure> {
        let started = Instant::now();
        let mut report = ConnectReport::default();
        let result = self.run(&ctx, &mut report).await;
        report.total = started.elapsed();

        match result {
            Ok((transport, capabilities)) => {
                info!(
                    "connected to {} via {} in {:?}",
                    ctx.device_id,
                    transport.kind(),
                    report.total
                );
                ctx.progress.emit(ConnectionProgress::Connected {
                    kind: transport.kind(),
                });
                Ok(Connected {
                    transport,
                    capabilities,
                    report,
                })
            }
            Err(error) => {
                warn!("connection to {} failed: {}", ctx.device_id, error);
                ctx.progress.emit(ConnectionProgress::Failed {
                    reason: error.kind().to_string(),
                });
                Err(ConnectFailure { error, report })
            }
        }
    }

    async fn run(
        &self,
        ctx: &ConnectionContext,
        report: &mut ConnectReport,
    ) -> ras_common::Result<(Transport, CapabilitiesResponse)> {
        ctx.progress.emit(ConnectionProgress::DiscoveringCapabilities);
        let local = match &self.local {
            Some(local) => local.clone(),
            None => {
                let nat = self
                    .peer_to_peer
                    .as_ref()
                    .map(|p| p.nat_type())
                    .unwrap_or(NatType::Unknown);
                LocalCapabilities::discover(self.peer_to_peer.is_some(), nat).await
            }
        };

        let session_id = new_session_id();
        let signaling = self.relay.as_ref().map(|relay| self.signaling(relay, ctx));
        let request = local.to_request(&ctx.device_id);

        let (remote, path) = match exchange_capabilities(
            &self.probe,
            signaling.as_deref(),
            ctx,
            &request,
            &session_id,
            self.config.relay_capabilities_timeout,
        )
        .await
        {
            Ok(exchanged) => exchanged,
            Err(CapabilityError::DeviceNotFound) => {
                return Err(Error::device_not_found(&ctx.device_id))
            }
            Err(CapabilityError::Unauthorized) => {
                return Err(Error::auth("daemon rejected capability request"))
            }
            Err(e) => {
                warn!("capability exchange failed, planning from stored hints: {}", e);
                report.capability_error = Some(e.to_string());
                (CapabilitiesResponse::default(), CapabilityPath::Hints)
            }
        };
        report.capability_path = Some(path);

        let available = Availability {
            peer_to_peer: self.peer_to_peer.is_some() && self.relay.is_some(),
            relay: self.relay.is_some(),
        };
        let plans = plan_strategies(&local, &remote, &ctx.hints, self.config.vpn_port, available);
        ctx.progress.emit(ConnectionProgress::CapabilitiesExchanged {
            path,
            strategies: plans.iter().map(StrategyPlan::kind).collect(),
        });
        debug!("planned strategies: {:?}", plans);

        if plans.is_empty() {
            return Err(Error::network("no viable transport strategy"));
        }

        let transport = match self.config.connect_mode {
            ConnectMode::Sequential => self.run_sequential(plans, ctx, &session_id, report).await,
            ConnectMode::Race => self.run_race(plans, ctx, &session_id, report).await,
        }?;
        Ok((transport, remote))
    }

    async fn run_sequential(
        &self,
        plans: Vec<StrategyPlan>,
        ctx: &ConnectionContext,
        session_id: &str,
        report: &mut ConnectReport,
    ) -> ras_common::Result<Transport> {
        let mut auth_failure = None;
        for plan in plans {
            let (attempt, result) = self.attempt(plan, ctx, session_id).await;
            report.attempts.push(attempt);
            match result {
                Ok(transport) => return Ok(transport),
                Err(e @ Error::AuthenticationFailed(_)) => auth_failure = Some(e),
                Err(_) => {}
            }
        }
        Err(exhausted(report, auth_failure))
    }

    /// All strategies at once; the first authenticated transport wins and
    /// the rest are dropped, which closes anything they opened.
    async fn run_race(
        &self,
        plans: Vec<StrategyPlan>,
        ctx: &ConnectionContext,
        session_id: &str,
        report: &mut ConnectReport,
    ) -> ras_common::Result<Transport> {
        let mut attempts: FuturesUnordered<_> = plans
            .into_iter()
            .map(|plan| self.attempt(plan, ctx, session_id))
            .collect();

        let mut auth_failure = None;
        while let Some((attempt, result)) = attempts.next().await {
            report.attempts.push(attempt);
            match result {
                Ok(transport) => return Ok(transport),
                Err(e @ Error::AuthenticationFailed(_)) => auth_failure = Some(e),
                Err(_) => {}
            }
        }
        Err(exhausted(report, auth_failure))
    }

    async fn attempt(
        &self,
        plan: StrategyPlan,
        ctx: &ConnectionContext,
        session_id: &str,
    ) -> (StrategyAttempt, ras_common::Result<Transport>) {
        let kind = plan.kind();
        ctx.progress.emit(ConnectionProgress::StrategyStarted { kind });
        debug!("attempting {} strategy", kind);

        let started = Instant::now();
        let result = match time::timeout(
            self.config.strategy_timeout,
            self.open_authenticated(plan, ctx, session_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("{} strategy", kind))),
        };
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(_) => {
                ctx.progress
                    .emit(ConnectionProgress::StrategySucceeded { kind, elapsed });
                AttemptOutcome::Connected
            }
            Err(e) => {
                info!("{} strategy failed after {:?}: {}", kind, elapsed, e);
                ctx.progress.emit(ConnectionProgress::StrategyFailed {
                    kind,
                    elapsed,
                    reason: e.to_string(),
                });
                AttemptOutcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                }
            }
        };
        (
            StrategyAttempt {
                kind,
                elapsed,
                outcome,
            },
            result,
        )
    }

    async fn open_authenticated(
        &self,
        plan: StrategyPlan,
        ctx: &ConnectionContext,
        session_id: &str,
    ) -> ras_common::Result<Transport> {
        let transport = self.open(plan, ctx, session_id).await?;
        if !transport.is_authenticated() {
            ctx.progress.emit(ConnectionProgress::Authenticating {
                kind: transport.kind(),
            });
            if let Err(e) = authenticate(&transport, &ctx.auth_key, self.config.auth_timeout).await
            {
                transport.close().await;
                return Err(e.into());
            }
            transport.mark_authenticated();
        }
        Ok(transport)
    }

    async fn open(
        &self,
        plan: StrategyPlan,
        ctx: &ConnectionContext,
        session_id: &str,
    ) -> Result<Transport, TransportError> {
        match plan {
            StrategyPlan::Vpn { peer } => {
                let config = VpnHandshakeConfig {
                    attempts: self.config.vpn_handshake_attempts,
                    attempt_timeout: self.config.vpn_attempt_timeout,
                };
                let transport = VpnTransport::connect(self.sockets.as_ref(), peer, config).await?;
                Ok(Transport::VpnOverlay(transport))
            }
            StrategyPlan::Lan { host, port } => {
                let transport = LanTransport::connect(
                    &host,
                    port,
                    &ctx.device_id,
                    &ctx.auth_key,
                    self.config.lan_auth_timeout,
                )
                .await?;
                Ok(Transport::LanDirect(transport))
            }
            StrategyPlan::PeerToPeer => {
                let (Some(connector), Some(relay)) = (&self.peer_to_peer, &self.relay) else {
                    return Err(TransportError::Protocol("peer-to-peer unavailable".into()));
                };
                let p2p = PeerToPeerContext {
                    signaling: self.signaling(relay, ctx),
                    session_id: session_id.to_string(),
                    device_id: ctx.device_id.clone(),
                    device_name: self.config.device_name.clone(),
                    answer_timeout: self.config.relay_capabilities_timeout,
                };
                let channel = connector.connect(&p2p).await?;
                Ok(Transport::PeerToPeer(ChannelTransport::new(
                    TransportKind::PeerToPeer,
                    channel,
                )))
            }
            StrategyPlan::Relay => {
                let Some(relay) = &self.relay else {
                    return Err(TransportError::Protocol("relay unavailable".into()));
                };
                let channel =
                    RelayDataChannel::open(self.signaling(relay, ctx), session_id, &ctx.device_id)
                        .await?;
                Ok(Transport::Relay(ChannelTransport::new(
                    TransportKind::Relay,
                    Box::new(channel),
                )))
            }
        }
    }

    fn signaling(&self, relay: &Arc<dyn SignalingRelay>, ctx: &ConnectionContext) -> Arc<SecureSignaling> {
        Arc::new(SecureSignaling::new(
            relay.clone(),
            &ctx.signaling_key,
            ctx.topic.clone(),
            self.config.signal_window,
            self.config.replay_cache_capacity,
        ))
    }
}

fn exhausted(report: &ConnectReport, auth_failure: Option<Error>) -> Error {
    if let Some(e) = auth_failure {
        return e;
    }
    Error::network(format!(
        "all {} transport strategies failed",
        report.attempts.len()
    ))
}
