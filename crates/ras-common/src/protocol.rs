//! Wire protocol shared by the phone agent and the daemon.
//!
//! - Signaling envelopes: JSON, sealed with the signaling key before they
//!   touch the relay.
//! - Capability exchange and post-connect authentication: protobuf.
//! - LAN-direct control frames: JSON text frames on the WebSocket.
//! - VPN-overlay handshake: a fixed 8-byte datagram echoed by the peer.

use serde::{Deserialize, Serialize};

/// Protocol version advertised during capability exchange.
pub const PROTOCOL_VERSION: u32 = 1;

/// Length of the per-envelope replay nonce.
pub const SIGNAL_NONCE_LEN: usize = 16;

/// Length of challenge nonces in the post-connect auth handshake.
pub const AUTH_NONCE_LEN: usize = 32;

/// VPN-overlay handshake datagram; the daemon echoes it verbatim.
pub const VPN_HANDSHAKE_MAGIC: [u8; 8] = *b"RASVPN\x00\x01";

/// Hex HMAC over the signed probe request.
pub const SIGNATURE_HEADER: &str = "X-RAS-Signature";

/// Unix seconds at which the probe request was signed.
pub const TIMESTAMP_HEADER: &str = "X-RAS-Timestamp";

/// Content type of protobuf probe bodies.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Domain labels mixed into auth handshake proofs, so the daemon's proof can
/// never be replayed as the client's.
pub const DAEMON_PROOF_LABEL: &[u8] = b"daemon";
pub const CLIENT_PROOF_LABEL: &[u8] = b"client";

// =============================================================================
// Signaling envelopes
// =============================================================================

/// Envelope types carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    PairRequest,
    PairResponse,
    CapabilitiesRequest,
    CapabilitiesResponse,
    Offer,
    Answer,
    Data,
}

impl SignalKind {
    /// Offer-class messages must carry the sender's identity.
    pub fn requires_identity(&self) -> bool {
        matches!(self, Self::Offer | Self::PairRequest)
    }

    /// Messages that carry a session description.
    pub fn requires_sdp(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PairRequest => "PAIR_REQUEST",
            Self::PairResponse => "PAIR_RESPONSE",
            Self::CapabilitiesRequest => "CAPABILITIES_REQUEST",
            Self::CapabilitiesResponse => "CAPABILITIES_RESPONSE",
            Self::Offer => "OFFER",
            Self::Answer => "ANSWER",
            Self::Data => "DATA",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext signaling envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub session_id: String,
    /// Unix seconds at which the sender built the envelope.
    pub timestamp: i64,
    /// Hex-encoded fresh random nonce (16 bytes).
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// Hex-encoded HMAC proof.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    /// Base64 protobuf or opaque data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl SignalEnvelope {
    pub fn new(
        kind: SignalKind,
        session_id: impl Into<String>,
        timestamp: i64,
        nonce: [u8; SIGNAL_NONCE_LEN],
    ) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            timestamp,
            nonce: hex::encode(nonce),
            device_id: None,
            device_name: None,
            sdp: None,
            proof: None,
            body: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self.device_name = Some(device_name.into());
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }

    pub fn with_proof(mut self, proof: impl Into<String>) -> Self {
        self.proof = Some(proof.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Decode the hex nonce, if well-formed.
    pub fn nonce_bytes(&self) -> Option<[u8; SIGNAL_NONCE_LEN]> {
        let bytes = hex::decode(&self.nonce).ok()?;
        bytes.try_into().ok()
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Capability exchange (protobuf)
// =============================================================================

/// Sent by the phone, either to `/capabilities/{id}`, `/reconnect/{id}`, or as
/// the body of a `CAPABILITIES_REQUEST` envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CapabilitiesRequest {
    #[prost(string, tag = "1")]
    pub device_id: String,
    /// Local VPN-overlay address, empty if none.
    #[prost(string, tag = "2")]
    pub overlay_address: String,
    #[prost(bool, tag = "3")]
    pub supports_vpn: bool,
    #[prost(bool, tag = "4")]
    pub supports_lan: bool,
    #[prost(bool, tag = "5")]
    pub supports_webrtc: bool,
    #[prost(uint32, tag = "6")]
    pub protocol_version: u32,
    /// 0 unknown, 1 open, 2 cone, 3 symmetric.
    #[prost(uint32, tag = "7")]
    pub nat_type: u32,
}

/// The daemon's answer to a capability request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CapabilitiesResponse {
    #[prost(string, tag = "1")]
    pub device_id: String,
    /// Daemon VPN-overlay address, empty if none.
    #[prost(string, tag = "2")]
    pub overlay_address: String,
    #[prost(uint32, tag = "3")]
    pub overlay_port: u32,
    #[prost(string, tag = "4")]
    pub lan_host: String,
    #[prost(uint32, tag = "5")]
    pub lan_port: u32,
    #[prost(bool, tag = "6")]
    pub supports_webrtc: bool,
    #[prost(uint32, tag = "7")]
    pub protocol_version: u32,
    #[prost(uint32, tag = "8")]
    pub nat_type: u32,
    /// Public IP as seen by the daemon's STUN probe, empty if unknown.
    #[prost(string, tag = "9")]
    pub public_ip: String,
}

// =============================================================================
// Post-connect authentication (protobuf)
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthChallenge {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResponse {
    /// HMAC(auth, "daemon" || client nonce)
    #[prost(bytes = "vec", tag = "1")]
    pub proof: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthConfirm {
    /// HMAC(auth, "client" || daemon nonce)
    #[prost(bytes = "vec", tag = "1")]
    pub proof: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResult {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthFrame {
    #[prost(oneof = "auth_frame::Step", tags = "1, 2, 3, 4")]
    pub step: Option<auth_frame::Step>,
}

pub mod auth_frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Step {
        #[prost(message, tag = "1")]
        Challenge(super::AuthChallenge),
        #[prost(message, tag = "2")]
        Response(super::AuthResponse),
        #[prost(message, tag = "3")]
        Confirm(super::AuthConfirm),
        #[prost(message, tag = "4")]
        Result(super::AuthResult),
    }
}

impl AuthFrame {
    pub fn challenge(nonce: Vec<u8>) -> Self {
        Self {
            step: Some(auth_frame::Step::Challenge(AuthChallenge { nonce })),
        }
    }

    pub fn response(proof: Vec<u8>, nonce: Vec<u8>) -> Self {
        Self {
            step: Some(auth_frame::Step::Response(AuthResponse { proof, nonce })),
        }
    }

    pub fn confirm(proof: Vec<u8>) -> Self {
        Self {
            step: Some(auth_frame::Step::Confirm(AuthConfirm { proof })),
        }
    }

    pub fn result(accepted: bool, reason: impl Into<String>) -> Self {
        Self {
            step: Some(auth_frame::Step::Result(AuthResult {
                accepted,
                reason: reason.into(),
            })),
        }
    }
}

/// Encode any protobuf message to bytes.
pub fn encode_msg<M: prost::Message>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Decode a protobuf message from bytes.
pub fn decode_msg<M: prost::Message + Default>(bytes: &[u8]) -> crate::Result<M> {
    Ok(M::decode(bytes)?)
}

// =============================================================================
// LAN-direct control frames (JSON)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanAuthStatus {
    Authenticated,
    Rejected,
}

/// Text frames exchanged on the LAN WebSocket before data flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LanControlFrame {
    /// First client frame. `signature` = hex HMAC(auth, device_id || timestamp || body).
    Auth {
        device_id: String,
        timestamp: i64,
        body: String,
        signature: String,
    },
    AuthResult {
        status: LanAuthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}
