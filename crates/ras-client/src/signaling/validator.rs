//! Inbound envelope validation.
//!
//! Checks run cheapest-first; the replay cache is consulted last so a
//! message that fails any other check never consumes a nonce slot.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ras_common::helpers::{has_control_chars, now_secs};
use ras_common::{SignalEnvelope, SignalKind, SIGNAL_NONCE_LEN};
use thiserror::Error;

const MAX_IDENTITY_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unexpected message type: expected {expected}, got {actual}")]
    WrongType {
        expected: SignalKind,
        actual: SignalKind,
    },

    #[error("session id mismatch")]
    SessionMismatch,

    #[error("timestamp outside window (skew {skew_secs}s)")]
    TimestampOutOfWindow { skew_secs: i64 },

    #[error("malformed nonce")]
    MalformedNonce,

    #[error("nonce replayed")]
    NonceReplay,

    #[error("malformed sdp: {0}")]
    MalformedSdp(&'static str),

    #[error("missing or invalid identity: {0}")]
    MissingIdentity(&'static str),
}

/// Bounded set of recently seen nonces, oldest evicted first.
#[derive(Debug)]
pub struct ReplayCache {
    seen: HashSet<[u8; SIGNAL_NONCE_LEN]>,
    order: VecDeque<[u8; SIGNAL_NONCE_LEN]>,
    capacity: usize,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `nonce`. Returns `false` if it was already present.
    pub fn insert(&mut self, nonce: [u8; SIGNAL_NONCE_LEN]) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, nonce: &[u8; SIGNAL_NONCE_LEN]) -> bool {
        self.seen.contains(nonce)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

/// Replay cache shared by every validator of one logical session.
#[derive(Debug, Clone)]
pub struct SharedReplayCache(Arc<Mutex<ReplayCache>>);

impl SharedReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(ReplayCache::new(capacity))))
    }

    pub fn insert(&self, nonce: [u8; SIGNAL_NONCE_LEN]) -> bool {
        self.lock().insert(nonce)
    }

    pub fn contains(&self, nonce: &[u8; SIGNAL_NONCE_LEN]) -> bool {
        self.lock().contains(nonce)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplayCache> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Validates envelopes expected for one session and message type.
#[derive(Debug, Clone)]
pub struct SignalValidator {
    expected: SignalKind,
    session_id: String,
    window: Duration,
    cache: SharedReplayCache,
}

impl SignalValidator {
    pub fn new(
        expected: SignalKind,
        session_id: impl Into<String>,
        window: Duration,
        cache: SharedReplayCache,
    ) -> Self {
        Self {
            expected,
            session_id: session_id.into(),
            window,
            cache,
        }
    }

    pub fn expected(&self) -> SignalKind {
        self.expected
    }

    pub fn validate(&self, envelope: &SignalEnvelope) -> Result<(), ValidationError> {
        self.validate_at(envelope, now_secs())
    }

    /// [`validate`](Self::validate) against an explicit clock.
    pub fn validate_at(&self, envelope: &SignalEnvelope, now: i64) -> Result<(), ValidationError> {
        if envelope.kind != self.expected {
            return Err(ValidationError::WrongType {
                expected: self.expected,
                actual: envelope.kind,
            });
        }
        if envelope.session_id != self.session_id {
            return Err(ValidationError::SessionMismatch);
        }

        let skew = now.saturating_sub(envelope.timestamp);
        if skew.unsigned_abs() > self.window.as_secs() {
            return Err(ValidationError::TimestampOutOfWindow { skew_secs: skew });
        }

        let nonce = envelope
            .nonce_bytes()
            .ok_or(ValidationError::MalformedNonce)?;

        if envelope.kind.requires_sdp() {
            check_sdp(envelope.sdp.as_deref())?;
        }
        if envelope.kind.requires_identity() {
            check_identity(envelope)?;
        }

        if !self.cache.insert(nonce) {
            return Err(ValidationError::NonceReplay);
        }
        Ok(())
    }
}

fn check_sdp(sdp: Option<&str>) -> Result<(), ValidationError> {
    let sdp = sdp
        .map(str::trim_start)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MalformedSdp("missing"))?;
    if !sdp.starts_with("v=") {
        return Err(ValidationError::MalformedSdp("missing version line"));
    }
    if !sdp.lines().any(|line| line.starts_with("m=")) {
        return Err(ValidationError::MalformedSdp("no media section"));
    }
    Ok(())
}

fn check_identity(envelope: &SignalEnvelope) -> Result<(), ValidationError> {
    let valid = |value: Option<&str>| {
        value.is_some_and(|v| {
            !v.trim().is_empty() && v.len() <= MAX_IDENTITY_LEN && !has_control_chars(v)
        })
    };
    if !valid(envelope.device_id.as_deref()) {
        return Err(ValidationError::MissingIdentity("device id"));
    }
    if !valid(envelope.device_name.as_deref()) {
        return Err(ValidationError::MissingIdentity("device name"));
    }
    Ok(())
}
