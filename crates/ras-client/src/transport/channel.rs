use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use super::{CloseSignal, StatsSnapshot, TransportError, TransportKind, TransportStats};

/// Message-oriented channel behind the peer-to-peer and relay transports.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;
    async fn close(&self);
}

/// Adds timeouts, stats and close bookkeeping to a [`DataChannel`].
pub struct ChannelTransport {
    kind: TransportKind,
    channel: Box<dyn DataChannel>,
    stats: TransportStats,
    closed: CloseSignal,
    authenticated: AtomicBool,
}

impl ChannelTransport {
    pub fn new(kind: TransportKind, channel: Box<dyn DataChannel>) -> Self {
        Self {
            kind,
            channel,
            stats: TransportStats::new(),
            closed: CloseSignal::new(),
            authenticated: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

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
        self.channel.send(data).await?;
        self.stats.record_sent(data.len());
        Ok(())
    }

    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        // A pending receive is dropped on close so the channel can shut down.
        let data = tokio::select! {
            _ = self.closed.closed() => return Err(TransportError::Closed),
            received = time::timeout(timeout, self.channel.receive()) => {
                received.map_err(|_| TransportError::Timeout)??
            }
        };
        self.stats.record_received(data.len());
        Ok(data)
    }

    pub async fn close(&self) {
        if self.closed.close() {
            self.channel.close().await;
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    struct LoopbackChannel {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataChannel for LoopbackChannel {
        async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
            self.tx.send(data.to_vec()).map_err(|_| TransportError::Closed)
        }

        async fn receive(&self) -> Result<Vec<u8>, TransportError> {
            self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loopback() -> (ChannelTransport, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let channel = LoopbackChannel {
            tx,
            rx: Mutex::new(rx),
            closes: closes.clone(),
        };
        (
            ChannelTransport::new(TransportKind::PeerToPeer, Box::new(channel)),
            closes,
        )
    }

    #[tokio::test]
    async fn test_send_receive_updates_stats() {
        let (transport, _) = loopback();
        transport.send(b"ping").await.unwrap();
        assert_eq!(
            transport.receive(Duration::from_secs(1)).await.unwrap(),
            b"ping"
        );
        let stats = transport.stats();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout() {
        let (transport, _) = loopback();
        assert!(matches!(
            transport.receive(Duration::from_millis(200)).await,
            Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (transport, closes) = loopback();
        transport.close().await;
        transport.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(
            transport.receive(Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (transport, closes) = loopback();
        let transport = Arc::new(transport);
        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive(Duration::from_secs(30)).await })
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
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
