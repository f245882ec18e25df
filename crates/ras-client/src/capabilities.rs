//! Capability discovery and exchange, and strategy planning from the result.
//!
//! The phone first probes the daemon directly with a signed HTTP request;
//! if that cannot reach it, the same protobuf request travels over the
//! relay. A 404 or 401 from the direct probe is final: the daemon was
//! reached and does not accept this device.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use ras_common::helpers::now_secs;
use ras_common::{
    decode_msg, encode_msg, CapabilitiesRequest, CapabilitiesResponse, SignalKind,
    PROTOBUF_CONTENT_TYPE, PROTOCOL_VERSION, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use ras_crypto::DerivedKey;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::p2p::{classify_nat, NatScenario, NatType};
use crate::signaling::{SecureSignaling, SignalingError};
use crate::transport::TransportKind;
use crate::types::{CapabilityPath, ConnectPurpose, ConnectionContext, ConnectionProgress, DaemonHints};

/// Routing target used to learn which local address faces the overlay.
/// Connecting a UDP socket sends nothing.
const OVERLAY_PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(100, 100, 100, 100), 53);

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("device not registered with daemon")]
    DeviceNotFound,

    #[error("daemon rejected request signature")]
    Unauthorized,

    #[error("daemon unreachable: {0}")]
    Unreachable(String),

    #[error("capability exchange timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("signaling error: {0}")]
    Signaling(SignalingError),
}

impl From<SignalingError> for CapabilityError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Timeout => Self::Timeout,
            other => Self::Signaling(other),
        }
    }
}

/// What this phone can do right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCapabilities {
    pub overlay_address: Option<IpAddr>,
    pub supports_webrtc: bool,
    pub nat_type: NatType,
    pub public_ip: Option<IpAddr>,
}

impl LocalCapabilities {
    pub async fn discover(supports_webrtc: bool, nat_type: NatType) -> Self {
        let overlay_address = detect_overlay_address().await;
        match overlay_address {
            Some(addr) => debug!("local overlay address {}", addr),
            None => debug!("no local overlay interface"),
        }
        Self {
            overlay_address,
            supports_webrtc,
            nat_type,
            public_ip: None,
        }
    }

    pub fn to_request(&self, device_id: &str) -> CapabilitiesRequest {
        CapabilitiesRequest {
            device_id: device_id.to_string(),
            overlay_address: self
                .overlay_address
                .map(|a| a.to_string())
                .unwrap_or_default(),
            supports_vpn: self.overlay_address.is_some(),
            supports_lan: true,
            supports_webrtc: self.supports_webrtc,
            protocol_version: PROTOCOL_VERSION,
            nat_type: self.nat_type.to_wire(),
        }
    }
}

/// Carrier-grade NAT range used by mesh VPNs (100.64.0.0/10) and the
/// Tailscale IPv6 ULA prefix (fd7a:115c:a1e0::/48).
pub fn is_overlay_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 100 && (b & 0xC0) == 64
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            s[0] == 0xfd7a && s[1] == 0x115c && s[2] == 0xa1e0
        }
    }
}

pub async fn detect_overlay_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(OVERLAY_PROBE_TARGET).await.ok()?;
    let local = socket.local_addr().ok()?.ip();
    is_overlay_address(local).then_some(local)
}

/// Hex HMAC over `method || path || timestamp || body`.
pub fn sign_probe(key: &DerivedKey, method: &str, path: &str, timestamp: i64, body: &[u8]) -> String {
    key.sign_hex(&[
        method.as_bytes(),
        path.as_bytes(),
        timestamp.to_string().as_bytes(),
        body,
    ])
}

pub fn probe_path(purpose: ConnectPurpose, device_id: &str) -> String {
    match purpose {
        ConnectPurpose::Initial => format!("/capabilities/{}", device_id),
        ConnectPurpose::Reconnect => format!("/reconnect/{}", device_id),
    }
}

/// Signed HTTP capability probe.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn probe(
        &self,
        base: &str,
        path: &str,
        auth_key: &DerivedKey,
        request: &CapabilitiesRequest,
    ) -> Result<CapabilitiesResponse, CapabilityError> {
        let body = encode_msg(request);
        let timestamp = now_secs();
        let signature = sign_probe(auth_key, "POST", path, timestamp, &body);

        let response = self
            .client
            .post(format!("{}{}", base, path))
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Timeout
                } else {
                    CapabilityError::Unreachable(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Err(CapabilityError::DeviceNotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CapabilityError::Unauthorized)
            }
            status if !status.is_success() => {
                return Err(CapabilityError::Unreachable(format!("daemon returned {}", status)))
            }
            _ => {}
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CapabilityError::Unreachable(e.to_string()))?;
        decode_msg(&bytes).map_err(|e| CapabilityError::Protocol(e.to_string()))
    }
}

/// Send `request` as a sealed CAPABILITIES_REQUEST and wait for the response.
pub async fn exchange_via_relay(
    signaling: &SecureSignaling,
    session_id: &str,
    ctx: &ConnectionContext,
    request: &CapabilitiesRequest,
    wait: Duration,
) -> Result<CapabilitiesResponse, CapabilityError> {
    let mut subscription = signaling.subscribe().await?;
    let envelope = signaling.envelope(SignalKind::CapabilitiesRequest, session_id);
    let proof = ctx.auth_key.sign_hex(&[
        ctx.device_id.as_bytes(),
        session_id.as_bytes(),
        envelope.nonce.as_bytes(),
    ]);
    let envelope = envelope
        .with_device_id(ctx.device_id.as_str())
        .with_proof(proof)
        .with_body(general_purpose::STANDARD.encode(encode_msg(request)));
    signaling.publish(&envelope).await?;

    let validator = signaling.validator(SignalKind::CapabilitiesResponse, session_id);
    let response = signaling
        .await_envelope(&mut subscription, &validator, wait)
        .await?;
    subscription.unsubscribe();

    let body = response
        .body
        .ok_or_else(|| CapabilityError::Protocol("capabilities response without body".into()))?;
    let bytes = general_purpose::STANDARD
        .decode(body)
        .map_err(|e| CapabilityError::Protocol(e.to_string()))?;
    decode_msg(&bytes).map_err(|e| CapabilityError::Protocol(e.to_string()))
}

/// Direct probe first, relay second. Definitive rejections short-circuit.
pub async fn exchange_capabilities(
    probe: &HttpProbe,
    signaling: Option<&SecureSignaling>,
    ctx: &ConnectionContext,
    request: &CapabilitiesRequest,
    session_id: &str,
    relay_timeout: Duration,
) -> Result<(CapabilitiesResponse, CapabilityPath), CapabilityError> {
    let mut last_error = None;

    if let Some(base) = ctx.hints.probe_base() {
        ctx.progress.emit(ConnectionProgress::ExchangingCapabilities {
            path: CapabilityPath::Direct,
        });
        let path = probe_path(ctx.purpose, &ctx.device_id);
        match probe.probe(&base, &path, &ctx.auth_key, request).await {
            Ok(response) => {
                info!("capabilities received directly from {}", base);
                return Ok((response, CapabilityPath::Direct));
            }
            Err(e @ (CapabilityError::DeviceNotFound | CapabilityError::Unauthorized)) => {
                warn!("daemon refused capability probe: {}", e);
                return Err(e);
            }
            Err(e) => {
                info!("direct capability probe failed, trying relay: {}", e);
                last_error = Some(e);
            }
        }
    }

    let Some(signaling) = signaling else {
        return Err(last_error
            .unwrap_or_else(|| CapabilityError::Unreachable("no daemon address or relay".into())));
    };

    ctx.progress.emit(ConnectionProgress::ExchangingCapabilities {
        path: CapabilityPath::Relay,
    });
    let response = exchange_via_relay(signaling, session_id, ctx, request, relay_timeout).await?;
    info!("capabilities received via relay");
    Ok((response, CapabilityPath::Relay))
}

/// One strategy the orchestrator may try, with the addressing it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyPlan {
    Vpn { peer: SocketAddr },
    Lan { host: String, port: u16 },
    PeerToPeer,
    Relay,
}

impl StrategyPlan {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Vpn { .. } => TransportKind::VpnOverlay,
            Self::Lan { .. } => TransportKind::LanDirect,
            Self::PeerToPeer => TransportKind::PeerToPeer,
            Self::Relay => TransportKind::Relay,
        }
    }
}

/// Which optional strategies the orchestrator has machinery for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Availability {
    pub peer_to_peer: bool,
    pub relay: bool,
}

/// Viable strategies in priority order.
pub fn plan_strategies(
    local: &LocalCapabilities,
    remote: &CapabilitiesResponse,
    hints: &DaemonHints,
    default_vpn_port: u16,
    available: Availability,
) -> Vec<StrategyPlan> {
    let mut plans = Vec::new();

    let remote_overlay = remote
        .overlay_address
        .parse::<IpAddr>()
        .ok()
        .or(hints.overlay_address);
    if let (Some(_), Some(ip)) = (local.overlay_address, remote_overlay) {
        let port = u16::try_from(remote.overlay_port)
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(default_vpn_port);
        plans.push(StrategyPlan::Vpn {
            peer: SocketAddr::new(ip, port),
        });
    }

    let lan_host = Some(remote.lan_host.clone())
        .filter(|h| !h.is_empty())
        .or_else(|| hints.host.clone());
    let lan_port = u16::try_from(remote.lan_port)
        .ok()
        .filter(|p| *p != 0)
        .or(hints.port);
    if let (Some(host), Some(port)) = (lan_host, lan_port) {
        plans.push(StrategyPlan::Lan { host, port });
    }

    if available.peer_to_peer && local.supports_webrtc && remote.supports_webrtc {
        let remote_public = remote.public_ip.parse::<IpAddr>().ok();
        let same_public_ip = local.public_ip.is_some() && local.public_ip == remote_public;
        let scenario = classify_nat(
            local.nat_type,
            NatType::from_wire(remote.nat_type),
            same_public_ip,
        );
        if scenario == NatScenario::RelayRequired {
            debug!("skipping p2p: nat combination needs a relay");
        } else {
            plans.push(StrategyPlan::PeerToPeer);
        }
    }

    if available.relay {
        plans.push(StrategyPlan::Relay);
    }
    plans
}
