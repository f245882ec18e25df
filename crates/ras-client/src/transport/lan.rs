//! Authenticated WebSocket straight to the daemon on the local network.
//!
//! The first frame is a signed auth frame; data flows only after the daemon
//! replies `authenticated`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use ras_common::helpers::now_secs;
use ras_common::{LanAuthStatus, LanControlFrame, PROTOCOL_VERSION};
use ras_crypto::DerivedKey;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{CloseSignal, StatsSnapshot, TransportError, TransportStats};
use crate::helpers::host_port;

type LanSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn lan_url(host: &str, port: u16, device_id: &str) -> String {
    format!("ws://{}/ws/{}", host_port(host, port), device_id)
}

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::WebSocket(err.to_string())
}

pub struct LanTransport {
    sink: Mutex<SplitSink<LanSocket, Message>>,
    stream: Mutex<SplitStream<LanSocket>>,
    stats: TransportStats,
    closed: CloseSignal,
    authenticated: AtomicBool,
}

impl LanTransport {
    pub async fn connect(
        host: &str,
        port: u16,
        device_id: &str,
        auth_key: &DerivedKey,
        auth_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = lan_url(host, port, device_id);
        info!("connecting lan websocket {}", url);
        let (ws, _) = connect_async(url.as_str()).await.map_err(ws_error)?;
        let (mut sink, mut stream) = ws.split();

        let timestamp = now_secs();
        let body = serde_json::json!({ "protocol_version": PROTOCOL_VERSION }).to_string();
        let signature = auth_key.sign_hex(&[
            device_id.as_bytes(),
            timestamp.to_string().as_bytes(),
            body.as_bytes(),
        ]);
        let frame = LanControlFrame::Auth {
            device_id: device_id.to_string(),
            timestamp,
            body,
            signature,
        };
        let text = serde_json::to_string(&frame)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(ws_error)?;

        match time::timeout(auth_timeout, await_auth_result(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("lan authentication failed: {}", e);
                let _ = sink.close().await;
                return Err(e);
            }
            Err(_) => {
                warn!("lan authentication timed out after {:?}", auth_timeout);
                let _ = sink.close().await;
                return Err(TransportError::AuthTimeout);
            }
        }
        info!("lan websocket authenticated");

        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            stats: TransportStats::new(),
            closed: CloseSignal::new(),
            authenticated: AtomicBool::new(false),
        })
    }

    /// Set once the post-connect handshake has verified the daemon.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(ws_error)?;
        self.stats.record_sent(data.len());
        Ok(())
    }

    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.closed.closed() => Err(TransportError::Closed),
            received = self.next_binary(Instant::now() + timeout) => received,
        }
    }

    async fn next_binary(&self, deadline: Instant) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let frame = time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?;
            match frame {
                Some(Ok(Message::Binary(data))) => {
                    self.stats.record_received(data.len());
                    return Ok(data.to_vec());
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.close();
                    return Err(TransportError::Closed);
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("ignoring {}-byte text frame on lan transport", text.len())
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }

    pub async fn close(&self) {
        if self.closed.close() {
            let _ = self.sink.lock().await.close().await;
            debug!("closed lan transport");
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

async fn await_auth_result(stream: &mut SplitStream<LanSocket>) -> Result<(), TransportError> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(ws_error)? {
            Message::Text(text) => {
                return match serde_json::from_str::<LanControlFrame>(&text) {
                    Ok(LanControlFrame::AuthResult {
                        status: LanAuthStatus::Authenticated,
                        ..
                    }) => Ok(()),
                    Ok(LanControlFrame::AuthResult {
                        status: LanAuthStatus::Rejected,
                        reason,
                    }) => Err(TransportError::AuthRejected(
                        reason.unwrap_or_else(|| "rejected by daemon".into()),
                    )),
                    _ => Err(TransportError::Protocol(
                        "unexpected frame before auth result".into(),
                    )),
                };
            }
            Message::Binary(_) => {
                return Err(TransportError::Protocol(
                    "data frame before authentication".into(),
                ))
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ras_crypto::{KeyPurpose, MasterSecret};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn auth_key() -> DerivedKey {
        MasterSecret::from_bytes([0x44; 32]).derive(KeyPurpose::Auth)
    }

    /// One-connection daemon: verifies the auth frame, then echoes binary frames.
    async fn spawn_daemon(reply: Option<LanAuthStatus>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let Some(Ok(Message::Text(text))) = ws.next().await else { return };
            let LanControlFrame::Auth { device_id, timestamp, body, signature } =
                serde_json::from_str::<LanControlFrame>(&text).unwrap()
            else {
                return;
            };
            let expected = auth_key().sign_hex(&[
                device_id.as_bytes(),
                timestamp.to_string().as_bytes(),
                body.as_bytes(),
            ]);
            let status = match reply {
                Some(status) => status,
                None => return std::future::pending::<()>().await,
            };
            let status = if signature == expected { status } else { LanAuthStatus::Rejected };
            let result = LanControlFrame::AuthResult { status, reason: None };
            ws.send(Message::Text(serde_json::to_string(&result).unwrap().into()))
                .await
                .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_binary() {
                    ws.send(msg).await.unwrap();
                }
            }
        });
        port
    }

    #[test]
    fn test_lan_url() {
        assert_eq!(lan_url("192.168.1.20", 8080, "phone-1"), "ws://192.168.1.20:8080/ws/phone-1");
        assert_eq!(lan_url("fe80::1", 8080, "p"), "ws://[fe80::1]:8080/ws/p");
    }

    #[tokio::test]
    async fn test_authenticated_echo() {
        let port = spawn_daemon(Some(LanAuthStatus::Authenticated)).await;
        let transport =
            LanTransport::connect("127.0.0.1", port, "phone-1", &auth_key(), Duration::from_secs(5))
                .await
                .unwrap();
        assert!(!transport.is_authenticated());

        transport.send(b"frame").await.unwrap();
        let echoed = transport.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(echoed, b"frame");

        transport.close().await;
        transport.close().await;
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_rejected() {
        let port = spawn_daemon(Some(LanAuthStatus::Rejected)).await;
        let result =
            LanTransport::connect("127.0.0.1", port, "phone-1", &auth_key(), Duration::from_secs(5))
                .await;
        assert!(matches!(result, Err(TransportError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let port = spawn_daemon(Some(LanAuthStatus::Authenticated)).await;
        let wrong = MasterSecret::from_bytes([0x45; 32]).derive(KeyPurpose::Auth);
        let result =
            LanTransport::connect("127.0.0.1", port, "phone-1", &wrong, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out() {
        let port = spawn_daemon(None).await;
        let result = LanTransport::connect(
            "127.0.0.1",
            port,
            "phone-1",
            &auth_key(),
            Duration::from_millis(300),
        )
        .await;
        assert!(matches!(result, Err(TransportError::AuthTimeout)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let port = spawn_daemon(Some(LanAuthStatus::Authenticated)).await;
        let transport = std::sync::Arc::new(
            LanTransport::connect("127.0.0.1", port, "phone-1", &auth_key(), Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive(Duration::from_secs(10)).await })
        };
        time::sleep(Duration::from_millis(50)).await;

        time::timeout(Duration::from_secs(1), transport.close())
            .await
            .unwrap();
        let received = time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, Err(TransportError::Closed)));
    }
}
