//! ntfy-compatible relay client.
//!
//! Publishing is a plain `POST {base}/{topic}`. Subscribing holds a
//! WebSocket to `{base}/{topic}/ws` inside a background task that pings
//! on an interval and reconnects with capped exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::SignalingError;

const SUBSCRIPTION_BUFFER: usize = 64;

/// Pub/sub relay carrying opaque text messages.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), SignalingError>;

    /// Returns once the subscription is live, so a publish issued afterwards
    /// cannot race past it.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError>;
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub keepalive: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub ready_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            max_attempts: 3,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Item delivered by a subscription's background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Message(String),
    /// Terminal: reconnection gave up.
    Failed(String),
}

/// A live topic subscription.
///
/// Unsubscribing is idempotent and also happens on drop, so an abandoned
/// subscription never leaves a background task behind.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<SubscriptionEvent>,
    task: Option<JoinHandle<()>>,
    active: bool,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        rx: mpsc::Receiver<SubscriptionEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            rx,
            task,
            active: true,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Next relayed message.
    pub async fn recv(&mut self) -> Result<String, SignalingError> {
        if !self.active {
            return Err(SignalingError::Closed);
        }
        match self.rx.recv().await {
            Some(SubscriptionEvent::Message(message)) => Ok(message),
            Some(SubscriptionEvent::Failed(reason)) => {
                self.active = false;
                Err(SignalingError::SubscriptionFailed(reason))
            }
            None => {
                self.active = false;
                Err(SignalingError::Closed)
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("unsubscribed from relay topic {}", self.topic);
        }
        self.active = false;
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// `min(base * 2^(attempt-1), cap)` for attempt >= 1.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}

#[derive(Debug, Deserialize)]
struct NtfyEvent {
    event: String,
    #[serde(default)]
    message: Option<String>,
}

/// Extract the payload of an ntfy `message` event. Keepalive, open and
/// anything unparseable yield `None`.
pub fn parse_relay_event(text: &str) -> Option<String> {
    let event: NtfyEvent = serde_json::from_str(text).ok()?;
    if event.event != "message" {
        return None;
    }
    event.message
}

/// Relay client speaking the ntfy HTTP/WebSocket API.
#[derive(Debug, Clone)]
pub struct NtfyRelay {
    http: reqwest::Client,
    base: Url,
    settings: RelaySettings,
}

impl NtfyRelay {
    pub fn new(base_url: &str, settings: RelaySettings) -> Result<Self, SignalingError> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| SignalingError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SignalingError::InvalidUrl(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        }
        let http = reqwest::Client::builder()
            .timeout(settings.ready_timeout)
            .build()
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            http,
            base,
            settings,
        })
    }

    fn publish_url(&self, topic: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), topic)
    }

    fn subscribe_url(&self, topic: &str) -> String {
        let scheme = if self.base.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        let rest = &self.base.as_str()[self.base.scheme().len()..];
        format!("{}{}/{}/ws", scheme, rest.trim_end_matches('/'), topic)
    }
}

#[async_trait]
impl SignalingRelay for NtfyRelay {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), SignalingError> {
        let response = self
            .http
            .post(self.publish_url(topic))
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| SignalingError::PublishFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SignalingError::PublishFailed(format!(
                "relay returned {}",
                response.status()
            )));
        }
        debug!("published {} bytes to relay", message.len());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let url = self.subscribe_url(topic);
        let task = tokio::spawn(run_subscription(
            url,
            self.settings.clone(),
            tx,
            Some(ready_tx),
        ));

        match time::timeout(self.settings.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Subscription::new(topic, rx, Some(task))),
            Ok(Ok(Err(e))) => {
                task.abort();
                Err(e)
            }
            Ok(Err(_)) => {
                task.abort();
                Err(SignalingError::SubscriptionFailed(
                    "subscription task ended".into(),
                ))
            }
            Err(_) => {
                task.abort();
                warn!("relay subscription not ready within {:?}", self.settings.ready_timeout);
                Err(SignalingError::Timeout)
            }
        }
    }
}

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum PumpExit {
    ReceiverGone,
    Disconnected(String),
}

async fn run_subscription(
    url: String,
    settings: RelaySettings,
    tx: mpsc::Sender<SubscriptionEvent>,
    mut ready: Option<oneshot::Sender<Result<(), SignalingError>>>,
) {
    let mut retries: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                retries = 0;
                info!("relay subscription connected");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                match pump(ws, &settings, &tx).await {
                    PumpExit::ReceiverGone => return,
                    PumpExit::Disconnected(reason) => {
                        warn!("relay subscription dropped: {}", reason)
                    }
                }
            }
            Err(e) => warn!("relay connect failed: {}", e),
        }

        if retries >= settings.max_attempts {
            let reason = format!("relay unreachable after {} reconnect attempts", retries);
            error!("{}", reason);
            match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(SignalingError::SubscriptionFailed(reason)));
                }
                None => {
                    let _ = tx.send(SubscriptionEvent::Failed(reason)).await;
                }
            }
            return;
        }

        retries += 1;
        let delay = backoff_delay(settings.backoff_base, settings.backoff_cap, retries);
        debug!(
            "relay reconnect {}/{} in {:?}",
            retries, settings.max_attempts, delay
        );
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = tx.closed() => return,
        }
    }
}

async fn pump(
    ws: RelaySocket,
    settings: &RelaySettings,
    tx: &mpsc::Sender<SubscriptionEvent>,
) -> PumpExit {
    let (mut sink, mut stream) = ws.split();
    let mut keepalive = time::interval_at(Instant::now() + settings.keepalive, settings.keepalive);

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return PumpExit::Disconnected(format!("keepalive failed: {}", e));
                }
            }
            _ = tx.closed() => {
                let _ = sink.close().await;
                return PumpExit::ReceiverGone;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(message) = parse_relay_event(&text) {
                        if tx.send(SubscriptionEvent::Message(message)).await.is_err() {
                            return PumpExit::ReceiverGone;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Disconnected("closed by relay".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpExit::Disconnected(e.to_string()),
            },
        }
    }
}
