//! Fake daemon pieces shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use futures::{SinkExt, StreamExt};
use ras_client::capabilities::{sign_probe, LocalCapabilities};
use ras_client::credentials::Credentials;
use ras_client::p2p::NatType;
use ras_client::signaling::{MemoryRelay, SecureSignaling};
use ras_client::transport::{ChannelTransport, RelayDataChannel, Transport, TransportKind};
use ras_client::ClientConfig;
use ras_common::auth_frame::Step;
use ras_common::{
    decode_msg, encode_msg, AuthFrame, CapabilitiesResponse, LanAuthStatus, LanControlFrame,
    SignalKind, CLIENT_PROOF_LABEL, DAEMON_PROOF_LABEL, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use ras_crypto::{constant_time_eq, DerivedKey, KeyPurpose, MasterSecret};
use tokio::net::{TcpListener, UdpSocket};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const DEVICE_ID: &str = "phone-1";

pub fn secret() -> MasterSecret {
    MasterSecret::from_bytes([0x2A; 32])
}

pub fn impostor_secret() -> MasterSecret {
    MasterSecret::from_bytes([0x2B; 32])
}

pub fn credentials(host: Option<&str>, port: Option<u16>) -> Credentials {
    let mut credentials = Credentials::new(DEVICE_ID, secret());
    credentials.daemon_host = host.map(str::to_string);
    credentials.daemon_port = port;
    credentials
}

/// Short timeouts so failing strategies fail fast.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        probe_timeout: Duration::from_secs(2),
        relay_capabilities_timeout: Duration::from_secs(3),
        vpn_handshake_attempts: 3,
        vpn_attempt_timeout: Duration::from_millis(100),
        lan_auth_timeout: Duration::from_secs(3),
        auth_timeout: Duration::from_secs(3),
        strategy_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

/// A phone that sits on the overlay network.
pub fn overlay_phone() -> LocalCapabilities {
    LocalCapabilities {
        overlay_address: Some("100.64.0.5".parse().unwrap()),
        supports_webrtc: false,
        nat_type: NatType::Unknown,
        public_ip: None,
    }
}

pub fn lan_only_phone() -> LocalCapabilities {
    LocalCapabilities::default()
}

/// Daemon side of the post-connect challenge-response.
pub struct DaemonAuth {
    key: DerivedKey,
    nonce: [u8; 32],
    done: bool,
}

impl DaemonAuth {
    pub fn new(secret: &MasterSecret) -> Self {
        Self {
            key: secret.derive(KeyPurpose::Auth),
            nonce: rand::random(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Reply to one inbound auth frame, if it warrants one.
    pub fn handle(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        let frame: AuthFrame = decode_msg(bytes).ok()?;
        match frame.step? {
            Step::Challenge(challenge) => {
                let proof = self.key.sign(&[DAEMON_PROOF_LABEL, &challenge.nonce]);
                Some(encode_msg(&AuthFrame::response(
                    proof.to_vec(),
                    self.nonce.to_vec(),
                )))
            }
            Step::Confirm(confirm) => {
                let expected = self.key.sign(&[CLIENT_PROOF_LABEL, &self.nonce]);
                self.done = constant_time_eq(&confirm.proof, &expected);
                let reason = if self.done { "" } else { "bad confirm" };
                Some(encode_msg(&AuthFrame::result(self.done, reason)))
            }
            _ => None,
        }
    }
}

struct HttpState {
    secret: MasterSecret,
    known_device: String,
    response: CapabilitiesResponse,
    hits: Mutex<Vec<String>>,
}

/// Signed capability endpoint. Records every request path.
pub struct HttpDaemon {
    pub port: u16,
    state: Arc<HttpState>,
}

impl HttpDaemon {
    pub fn hits(&self) -> Vec<String> {
        self.state.hits.lock().unwrap().clone()
    }
}

async fn capabilities(
    State(state): State<Arc<HttpState>>,
    Path(device_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    state.hits.lock().unwrap().push(uri.path().to_string());

    if device_id != state.known_device {
        return (StatusCode::NOT_FOUND, Vec::new());
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let (Some(signature), Some(timestamp)) = (header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER))
    else {
        return (StatusCode::UNAUTHORIZED, Vec::new());
    };
    let Ok(timestamp) = timestamp.parse::<i64>() else {
        return (StatusCode::UNAUTHORIZED, Vec::new());
    };
    let expected = sign_probe(
        &state.secret.derive(KeyPurpose::Auth),
        "POST",
        uri.path(),
        timestamp,
        &body,
    );
    if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, Vec::new());
    }
    (StatusCode::OK, encode_msg(&state.response))
}

pub async fn spawn_http(
    secret: MasterSecret,
    known_device: &str,
    response: CapabilitiesResponse,
) -> HttpDaemon {
    let state = Arc::new(HttpState {
        secret,
        known_device: known_device.to_string(),
        response,
        hits: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/capabilities/:device_id", post(capabilities))
        .route("/reconnect/:device_id", post(capabilities))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    HttpDaemon { port, state }
}

/// LAN WebSocket daemon. `lan_secret` verifies the first frame,
/// `handshake_secret` answers the post-connect challenge; they differ only
/// when simulating an impostor. Echoes data once authenticated.
pub async fn spawn_lan(lan_secret: MasterSecret, handshake_secret: MasterSecret) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let lan_key = lan_secret.derive(KeyPurpose::Auth);
            let mut auth = DaemonAuth::new(&handshake_secret);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(tcp).await else { return };
                let Some(Ok(Message::Text(text))) = ws.next().await else { return };
                let Ok(LanControlFrame::Auth {
                    device_id,
                    timestamp,
                    body,
                    signature,
                }) = serde_json::from_str::<LanControlFrame>(&text)
                else {
                    return;
                };
                let expected = lan_key.sign_hex(&[
                    device_id.as_bytes(),
                    timestamp.to_string().as_bytes(),
                    body.as_bytes(),
                ]);
                let status = if signature == expected {
                    LanAuthStatus::Authenticated
                } else {
                    LanAuthStatus::Rejected
                };
                let result = LanControlFrame::AuthResult {
                    status,
                    reason: None,
                };
                let text = serde_json::to_string(&result).unwrap();
                if ws.send(Message::Text(text.into())).await.is_err() {
                    return;
                }

                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Binary(data) = msg else { continue };
                    let reply = if auth.is_done() {
                        Some(data.to_vec())
                    } else {
                        auth.handle(&data)
                    };
                    if let Some(reply) = reply {
                        if ws.send(Message::Binary(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    port
}

/// UDP peer that echoes every datagram, handshake magic included.
pub async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });
    port
}

/// UDP peer that swallows everything.
pub async fn spawn_udp_silent() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while socket.recv_from(&mut buf).await.is_ok() {}
    });
    port
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Daemon reachable only through the relay: answers the first verified
/// CAPABILITIES_REQUEST, then serves the relay data channel for that session.
pub async fn spawn_relay_daemon(relay: &MemoryRelay, secret: MasterSecret, response: CapabilitiesResponse) {
    let signaling = Arc::new(SecureSignaling::new(
        Arc::new(relay.clone()),
        &secret.derive(KeyPurpose::Signaling),
        secret.topic(),
        Duration::from_secs(30),
        100,
    ));
    let auth_key = secret.derive(KeyPurpose::Auth);
    let mut requests = signaling.subscribe().await.unwrap();

    tokio::spawn(async move {
        let session_id = loop {
            let Ok(message) = requests.recv().await else { return };
            let Ok(envelope) = signaling.open(&message) else { continue };
            if envelope.kind != SignalKind::CapabilitiesRequest {
                continue;
            }
            let device_id = envelope.device_id.clone().unwrap_or_default();
            let expected = auth_key.sign_hex(&[
                device_id.as_bytes(),
                envelope.session_id.as_bytes(),
                envelope.nonce.as_bytes(),
            ]);
            if envelope.proof.as_deref() == Some(expected.as_str()) {
                break envelope.session_id;
            }
        };
        requests.unsubscribe();

        let channel = RelayDataChannel::open(signaling.clone(), session_id.clone(), "daemon")
            .await
            .unwrap();
        let transport = Transport::Relay(ChannelTransport::new(
            TransportKind::Relay,
            Box::new(channel),
        ));

        let reply = signaling
            .envelope(SignalKind::CapabilitiesResponse, &session_id)
            .with_body(general_purpose::STANDARD.encode(encode_msg(&response)));
        signaling.publish(&reply).await.unwrap();

        let mut auth = DaemonAuth::new(&secret);
        while let Ok(data) = transport.receive(Duration::from_secs(30)).await {
            let reply = if auth.is_done() {
                Some(data)
            } else {
                auth.handle(&data)
            };
            if let Some(reply) = reply {
                if transport.send(&reply).await.is_err() {
                    return;
                }
            }
        }
    });
}
