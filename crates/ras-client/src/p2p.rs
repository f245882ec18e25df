//! Peer-to-peer seam.
//!
//! The WebRTC engine itself lives outside this crate behind
//! [`PeerToPeerConnector`]. What stays here is the signaling it needs
//! (OFFER/ANSWER over the sealed relay), candidate filtering, and a coarse
//! NAT classification used to decide whether trying P2P is worthwhile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ras_common::SignalKind;
use tracing::debug;

use crate::signaling::{SecureSignaling, SignalingError};
use crate::transport::{DataChannel, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    /// Publicly reachable, no translation.
    Open,
    /// Endpoint-independent mapping.
    Cone,
    /// Mapping changes per destination.
    Symmetric,
    #[default]
    Unknown,
}

impl NatType {
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::Cone,
            3 => Self::Symmetric,
            _ => Self::Unknown,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Open => 1,
            Self::Cone => 2,
            Self::Symmetric => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatScenario {
    SameNetwork,
    DirectFeasible,
    HolePunchLikely,
    RelayRequired,
}

pub fn classify_nat(local: NatType, remote: NatType, same_public_ip: bool) -> NatScenario {
    use NatType::*;
    if same_public_ip {
        return NatScenario::SameNetwork;
    }
    match (local, remote) {
        (Open, _) | (_, Open) => NatScenario::DirectFeasible,
        (Symmetric, Symmetric) | (Symmetric, Cone) | (Cone, Symmetric) => {
            NatScenario::RelayRequired
        }
        _ => NatScenario::HolePunchLikely,
    }
}

/// Which ICE candidate types survive [`filter_sdp_candidates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub host: bool,
    pub srflx: bool,
    pub relay: bool,
    /// Keep mDNS-obfuscated `.local` host candidates.
    pub mdns: bool,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self {
            host: true,
            srflx: true,
            relay: true,
            mdns: false,
        }
    }
}

/// Drop `a=candidate` lines the policy does not allow. Other lines and the
/// original line endings are kept.
pub fn filter_sdp_candidates(sdp: &str, policy: CandidatePolicy) -> String {
    sdp.split_inclusive('\n')
        .filter(|line| keep_candidate_line(line.trim_end(), policy))
        .collect()
}

fn keep_candidate_line(line: &str, policy: CandidatePolicy) -> bool {
    let Some(candidate) = line.strip_prefix("a=candidate:") else {
        return true;
    };
    let fields: Vec<&str> = candidate.split_whitespace().collect();
    let address = fields.get(4).copied().unwrap_or_default();
    let kind = fields
        .iter()
        .position(|f| *f == "typ")
        .and_then(|i| fields.get(i + 1))
        .copied()
        .unwrap_or_default();

    match kind {
        "host" if address.ends_with(".local") => policy.host && policy.mdns,
        "host" => policy.host,
        "srflx" | "prflx" => policy.srflx,
        "relay" => policy.relay,
        _ => false,
    }
}

/// Signaling handles passed to a connector.
pub struct PeerToPeerContext {
    pub signaling: Arc<SecureSignaling>,
    pub session_id: String,
    pub device_id: String,
    pub device_name: String,
    pub answer_timeout: Duration,
}

impl PeerToPeerContext {
    /// Publish our OFFER and wait for the daemon's ANSWER SDP.
    pub async fn exchange_offer(&self, local_sdp: &str) -> Result<String, TransportError> {
        let mut subscription = self.signaling.subscribe().await?;
        let offer = self
            .signaling
            .envelope(SignalKind::Offer, &self.session_id)
            .with_device(self.device_id.as_str(), self.device_name.as_str())
            .with_sdp(local_sdp);
        self.signaling.publish(&offer).await?;
        debug!("published p2p offer");

        let validator = self.signaling.validator(SignalKind::Answer, &self.session_id);
        let answer = self
            .signaling
            .await_envelope(&mut subscription, &validator, self.answer_timeout)
            .await?;
        subscription.unsubscribe();
        answer
            .sdp
            .ok_or(TransportError::Signaling(SignalingError::Malformed(
                "answer without sdp".into(),
            )))
    }
}

#[async_trait]
pub trait PeerToPeerConnector: Send + Sync {
    /// This side's NAT type, if the engine has probed it.
    fn nat_type(&self) -> NatType {
        NatType::Unknown
    }

    async fn connect(&self, ctx: &PeerToPeerContext) -> Result<Box<dyn DataChannel>, TransportError>;
}
