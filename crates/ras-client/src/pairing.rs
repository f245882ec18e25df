//! One-shot pairing over the relay.
//!
//! The QR code carries the master secret and a session id. The phone proves
//! knowledge of the secret with `HMAC(auth, session_id || device_id || nonce)`
//! and the daemon answers with `HMAC(auth, nonce)`. Nothing is persisted
//! unless the daemon's proof verifies.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use ras_common::{decode_msg, CapabilitiesResponse, SignalKind};
use ras_crypto::{constant_time_eq, KeyPurpose, MasterSecret};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::credentials::{CredentialRepository, Credentials};
use crate::helpers::random_bytes;
use crate::signaling::{SecureSignaling, SignalingError, SignalingRelay, Subscription};

/// Inputs scanned from the pairing QR code plus this phone's identity.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub master_secret: MasterSecret,
    pub session_id: String,
    pub device_id: String,
    pub device_name: String,
}

impl PairingRequest {
    pub fn new(
        master_secret: MasterSecret,
        session_id: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            master_secret,
            session_id: session_id.into(),
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: device_name.into(),
        }
    }
}

/// What the daemon told us about itself in a verified response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedIdentity {
    pub device_id: String,
    pub daemon_host: Option<String>,
    pub daemon_port: Option<u16>,
    pub overlay_address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairExchangeResult {
    Success(PairedIdentity),
    /// The daemon's proof was missing or wrong.
    AuthFailed,
    Timeout,
    Error(String),
}

impl PairExchangeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

pub struct PairingExchanger {
    relay: Arc<dyn SignalingRelay>,
    timeout: Duration,
    window: Duration,
    replay_capacity: usize,
}

impl PairingExchanger {
    pub fn new(relay: Arc<dyn SignalingRelay>, config: &ClientConfig) -> Self {
        Self {
            relay,
            timeout: config.pairing_timeout,
            window: config.signal_window,
            replay_capacity: config.replay_cache_capacity,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the exchange. The subscription is always released and derived
    /// keys are zeroized on return, including on cancellation.
    pub async fn exchange(&self, request: &PairingRequest) -> PairExchangeResult {
        let secret = &request.master_secret;
        let signaling = SecureSignaling::new(
            self.relay.clone(),
            &secret.derive(KeyPurpose::Signaling),
            secret.topic(),
            self.window,
            self.replay_capacity,
        );

        // Subscribe before publishing so a fast daemon cannot answer into the void.
        let mut subscription = match signaling.subscribe().await {
            Ok(subscription) => subscription,
            Err(SignalingError::Timeout) => return PairExchangeResult::Timeout,
            Err(e) => return PairExchangeResult::Error(e.to_string()),
        };

        let result = self.run(request, &signaling, &mut subscription).await;

        subscription.unsubscribe();
        signaling.end_session();
        result
    }

    /// [`exchange`](Self::exchange), storing credentials only on success.
    pub async fn pair(
        &self,
        request: &PairingRequest,
        repository: &dyn CredentialRepository,
    ) -> PairExchangeResult {
        let result = self.exchange(request).await;
        if let PairExchangeResult::Success(identity) = &result {
            let credentials = Credentials {
                device_id: identity.device_id.clone(),
                master_secret: request.master_secret.clone(),
                daemon_host: identity.daemon_host.clone(),
                daemon_port: identity.daemon_port,
                overlay_address: identity.overlay_address,
            };
            if let Err(e) = repository.store_credentials(credentials) {
                warn!("failed to persist pairing credentials: {}", e);
                return PairExchangeResult::Error(e.to_string());
            }
            info!("paired as device {}", identity.device_id);
        }
        result
    }

    async fn run(
        &self,
        request: &PairingRequest,
        signaling: &SecureSignaling,
        subscription: &mut Subscription,
    ) -> PairExchangeResult {
        let auth_key = request.master_secret.derive(KeyPurpose::Auth);
        let nonce: [u8; 16] = random_bytes();
        let proof = auth_key.sign_hex(&[
            request.session_id.as_bytes(),
            request.device_id.as_bytes(),
            &nonce,
        ]);

        let envelope = ras_common::SignalEnvelope::new(
            SignalKind::PairRequest,
            request.session_id.as_str(),
            ras_common::helpers::now_secs(),
            nonce,
        )
        .with_device(request.device_id.as_str(), request.device_name.as_str())
        .with_proof(proof);

        if let Err(e) = signaling.publish(&envelope).await {
            warn!("pair request publish failed: {}", e);
            return PairExchangeResult::Error(e.to_string());
        }
        debug!("pair request published, awaiting response");

        let validator = signaling.validator(SignalKind::PairResponse, &request.session_id);
        let response = match signaling
            .await_envelope(subscription, &validator, self.timeout)
            .await
        {
            Ok(response) => response,
            Err(SignalingError::Timeout) => {
                warn!("pairing timed out after {:?}", self.timeout);
                return PairExchangeResult::Timeout;
            }
            Err(e) => return PairExchangeResult::Error(e.to_string()),
        };

        let expected = auth_key.sign(&[&nonce]);
        let proof_ok = response
            .proof
            .as_deref()
            .and_then(|p| hex::decode(p).ok())
            .is_some_and(|p| constant_time_eq(&p, &expected));
        if !proof_ok {
            warn!("pair response proof did not verify");
            return PairExchangeResult::AuthFailed;
        }

        let Some(device_id) = response.device_id.filter(|id| !id.trim().is_empty()) else {
            return PairExchangeResult::Error("pair response missing device id".into());
        };

        let mut identity = PairedIdentity {
            device_id,
            daemon_host: None,
            daemon_port: None,
            overlay_address: None,
        };
        if let Some(body) = response.body.as_deref() {
            match decode_daemon_info(body) {
                Some(info) => {
                    identity.daemon_host = Some(info.lan_host).filter(|h| !h.is_empty());
                    identity.daemon_port = u16::try_from(info.lan_port).ok().filter(|p| *p != 0);
                    identity.overlay_address = info.overlay_address.parse().ok();
                }
                None => debug!("ignoring undecodable daemon info in pair response"),
            }
        }
        PairExchangeResult::Success(identity)
    }
}

fn decode_daemon_info(body: &str) -> Option<CapabilitiesResponse> {
    let bytes = general_purpose::STANDARD.decode(body).ok()?;
    decode_msg(&bytes).ok()
}
