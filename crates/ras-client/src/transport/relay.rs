//! Data channel tunnelled through the signaling relay.
//!
//! Each message is a sealed `DATA` envelope with a base64 body. Slow and
//! public, so it is the last strategy tried.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ras_common::SignalKind;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CloseSignal, DataChannel, TransportError};
use crate::signaling::{SecureSignaling, SignalValidator, SignalingError, Subscription};

pub struct RelayDataChannel {
    signaling: Arc<SecureSignaling>,
    session_id: String,
    device_id: String,
    subscription: Mutex<Subscription>,
    validator: SignalValidator,
    closed: CloseSignal,
}

impl RelayDataChannel {
    pub async fn open(
        signaling: Arc<SecureSignaling>,
        session_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let session_id = session_id.into();
        let subscription = signaling.subscribe().await?;
        let validator = signaling.validator(SignalKind::Data, &session_id);
        Ok(Self {
            signaling,
            session_id,
            device_id: device_id.into(),
            subscription: Mutex::new(subscription),
            validator,
            closed: CloseSignal::new(),
        })
    }

    async fn next_data(&self) -> Result<Vec<u8>, TransportError> {
        let mut subscription = self.subscription.lock().await;
        loop {
            let envelope = match self
                .signaling
                .next_valid(&mut subscription, &self.validator)
                .await
            {
                Ok(envelope) => envelope,
                Err(SignalingError::Closed) => return Err(TransportError::Closed),
                Err(e) => return Err(e.into()),
            };
            match envelope.body.as_deref().map(|b| general_purpose::STANDARD.decode(b)) {
                Some(Ok(data)) => return Ok(data),
                _ => debug!("dropping relay data envelope without a valid body"),
            }
        }
    }
}

#[async_trait]
impl DataChannel for RelayDataChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let envelope = self
            .signaling
            .envelope(SignalKind::Data, &self.session_id)
            .with_device_id(self.device_id.as_str())
            .with_body(general_purpose::STANDARD.encode(data));
        self.signaling.publish(&envelope).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }
        // Dropping `next_data` releases the subscription lock for `close`.
        tokio::select! {
            _ = self.closed.closed() => Err(TransportError::Closed),
            received = self.next_data() => received,
        }
    }

    async fn close(&self) {
        if self.closed.close() {
            self.subscription.lock().await.unsubscribe();
            self.signaling.end_session();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryRelay;
    use crate::transport::{ChannelTransport, Transport, TransportKind};
    use ras_crypto::{KeyPurpose, MasterSecret};
    use std::time::Duration;

    fn signaling(relay: &MemoryRelay, secret: &MasterSecret) -> Arc<SecureSignaling> {
        Arc::new(SecureSignaling::new(
            Arc::new(relay.clone()),
            &secret.derive(KeyPurpose::Signaling),
            secret.topic(),
            Duration::from_secs(30),
            100,
        ))
    }

    #[tokio::test]
    async fn test_relay_data_between_peers() {
        let relay = MemoryRelay::new();
        let secret = MasterSecret::from_bytes([0x51; 32]);

        let phone = RelayDataChannel::open(signaling(&relay, &secret), "s-9", "phone-1")
            .await
            .unwrap();
        let daemon = RelayDataChannel::open(signaling(&relay, &secret), "s-9", "daemon")
            .await
            .unwrap();
        let phone = ChannelTransport::new(TransportKind::Relay, Box::new(phone));

        phone.send(b"from phone").await.unwrap();
        assert_eq!(daemon.receive().await.unwrap(), b"from phone");

        daemon.send(b"from daemon").await.unwrap();
        // The phone's own echo is skipped.
        assert_eq!(
            phone.receive(Duration::from_secs(1)).await.unwrap(),
            b"from daemon"
        );

        phone.close().await;
        assert_eq!(relay.subscriber_count(&secret.topic()), 1);
    }

    #[tokio::test]
    async fn test_close_releases_pending_receive() {
        let relay = MemoryRelay::new();
        let secret = MasterSecret::from_bytes([0x52; 32]);
        let channel = RelayDataChannel::open(signaling(&relay, &secret), "s-10", "phone-1")
            .await
            .unwrap();
        let transport = Arc::new(Transport::Relay(ChannelTransport::new(
            TransportKind::Relay,
            Box::new(channel),
        )));

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive(Duration::from_secs(20)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), transport.close())
            .await
            .expect("close must not wait for the pending receive");
        let received = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, Err(TransportError::Closed)));
        assert_eq!(relay.subscriber_count(&secret.topic()), 0);
    }

    #[tokio::test]
    async fn test_direct_close_wakes_receiver() {
        let relay = MemoryRelay::new();
        let secret = MasterSecret::from_bytes([0x53; 32]);
        let channel = Arc::new(
            RelayDataChannel::open(signaling(&relay, &secret), "s-11", "daemon")
                .await
                .unwrap(),
        );

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), channel.close())
            .await
            .unwrap();
        assert!(matches!(pending.await.unwrap(), Err(TransportError::Closed)));
        assert!(matches!(channel.receive().await, Err(TransportError::Closed)));
    }
}
