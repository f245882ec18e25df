use std::sync::Arc;
use std::time::Duration;

use ras_common::helpers::now_secs;
use ras_common::{SignalEnvelope, SignalKind};
use ras_crypto::{DerivedKey, SignalingCodec};
use tokio::time;
use tracing::debug;

use super::{SharedReplayCache, SignalValidator, SignalingError, SignalingRelay, Subscription};
use crate::helpers::random_bytes;

/// Sealed envelopes on one relay topic.
///
/// Anyone can publish to the topic, so inbound traffic that fails to decrypt
/// or validate is dropped and the wait continues.
pub struct SecureSignaling {
    relay: Arc<dyn SignalingRelay>,
    codec: SignalingCodec,
    topic: String,
    window: Duration,
    cache: SharedReplayCache,
}

impl SecureSignaling {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        signaling_key: &DerivedKey,
        topic: impl Into<String>,
        window: Duration,
        replay_capacity: usize,
    ) -> Self {
        Self {
            relay,
            codec: SignalingCodec::new(signaling_key),
            topic: topic.into(),
            window,
            cache: SharedReplayCache::new(replay_capacity),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fresh envelope stamped with the current time and a random nonce.
    pub fn envelope(&self, kind: SignalKind, session_id: &str) -> SignalEnvelope {
        SignalEnvelope::new(kind, session_id, now_secs(), random_bytes())
    }

    pub fn validator(&self, kind: SignalKind, session_id: &str) -> SignalValidator {
        SignalValidator::new(kind, session_id, self.window, self.cache.clone())
    }

    pub fn seal(&self, envelope: &SignalEnvelope) -> Result<String, SignalingError> {
        let json = envelope
            .to_json()
            .map_err(|e| SignalingError::Malformed(e.to_string()))?;
        Ok(self.codec.encode_base64(&json)?)
    }

    pub fn open(&self, message: &str) -> Result<SignalEnvelope, SignalingError> {
        let json = self.codec.decode_base64(message)?;
        SignalEnvelope::from_json(&json).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Seal and publish. The envelope's own nonce is recorded first so the
    /// relay echoing it back cannot pass validation.
    pub async fn publish(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        if let Some(nonce) = envelope.nonce_bytes() {
            self.cache.insert(nonce);
        }
        let sealed = self.seal(envelope)?;
        self.relay.publish(&self.topic, &sealed).await?;
        debug!("published {} envelope", envelope.kind);
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<Subscription, SignalingError> {
        self.relay.subscribe(&self.topic).await
    }

    /// Next envelope on `subscription` that opens and passes `validator`.
    pub async fn next_valid(
        &self,
        subscription: &mut Subscription,
        validator: &SignalValidator,
    ) -> Result<SignalEnvelope, SignalingError> {
        loop {
            let message = subscription.recv().await?;
            let envelope = match self.open(&message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("dropping undecodable relay message: {}", e);
                    continue;
                }
            };
            match validator.validate(&envelope) {
                Ok(()) => return Ok(envelope),
                Err(e) => debug!(
                    "dropping {} envelope while awaiting {}: {}",
                    envelope.kind,
                    validator.expected(),
                    e
                ),
            }
        }
    }

    /// [`next_valid`](Self::next_valid) bounded by `wait`.
    pub async fn await_envelope(
        &self,
        subscription: &mut Subscription,
        validator: &SignalValidator,
        wait: Duration,
    ) -> Result<SignalEnvelope, SignalingError> {
        time::timeout(wait, self.next_valid(subscription, validator))
            .await
            .map_err(|_| SignalingError::Timeout)?
    }

    /// Forget every nonce seen in this session.
    pub fn end_session(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryRelay;
    use ras_crypto::{KeyPurpose, MasterSecret};

    fn signaling(relay: &MemoryRelay, secret: &MasterSecret) -> SecureSignaling {
        SecureSignaling::new(
            Arc::new(relay.clone()),
            &secret.derive(KeyPurpose::Signaling),
            secret.topic(),
            Duration::from_secs(30),
            100,
        )
    }

    #[test]
    fn test_seal_open() {
        let secret = MasterSecret::from_bytes([4; 32]);
        let relay = MemoryRelay::new();
        let channel = signaling(&relay, &secret);

        let env = channel.envelope(SignalKind::Data, "s-1").with_body("aGk=");
        let sealed = channel.seal(&env).unwrap();
        assert!(!sealed.contains("s-1"));
        assert_eq!(channel.open(&sealed).unwrap(), env);

        let stranger = signaling(&relay, &MasterSecret::from_bytes([5; 32]));
        assert!(matches!(stranger.open(&sealed), Err(SignalingError::Codec(_))));
    }

    #[tokio::test]
    async fn test_skips_junk_and_own_echo() {
        let secret = MasterSecret::from_bytes([6; 32]);
        let relay = MemoryRelay::new();
        let phone = signaling(&relay, &secret);
        let daemon = signaling(&relay, &secret);

        let mut sub = phone.subscribe().await.unwrap();
        relay.publish(phone.topic(), "garbage from a stranger").await.unwrap();
        phone
            .publish(&phone.envelope(SignalKind::Data, "s-1").with_body("bWluZQ=="))
            .await
            .unwrap();
        daemon
            .publish(&daemon.envelope(SignalKind::Data, "s-1").with_body("dGhlaXJz"))
            .await
            .unwrap();

        let validator = phone.validator(SignalKind::Data, "s-1");
        let got = phone
            .await_envelope(&mut sub, &validator, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.body.as_deref(), Some("dGhlaXJz"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_times_out() {
        let secret = MasterSecret::from_bytes([7; 32]);
        let relay = MemoryRelay::new();
        let phone = signaling(&relay, &secret);
        let mut sub = phone.subscribe().await.unwrap();
        let validator = phone.validator(SignalKind::PairResponse, "s-1");
        assert_eq!(
            phone
                .await_envelope(&mut sub, &validator, Duration::from_secs(30))
                .await,
            Err(SignalingError::Timeout)
        );
    }
}
