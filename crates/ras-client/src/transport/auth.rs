//! Mutual challenge-response run on a fresh transport that the daemon has
//! not yet proven itself on.
//!
//! ```text
//! phone  ── Challenge(cn) ──────────────────────────► daemon
//! phone  ◄─ Response(HMAC(auth,"daemon"‖cn), dn) ─── daemon
//! phone  ── Confirm(HMAC(auth,"client"‖dn)) ────────► daemon
//! phone  ◄─ Result(accepted) ─────────────────────── daemon
//! ```

use std::time::Duration;

use ras_common::auth_frame::Step;
use ras_common::{
    decode_msg, encode_msg, AuthFrame, AUTH_NONCE_LEN, CLIENT_PROOF_LABEL, DAEMON_PROOF_LABEL,
};
use ras_crypto::{constant_time_eq, DerivedKey};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::{Transport, TransportError};
use crate::helpers::random_bytes;

/// Run the handshake within `wait`. The caller closes the transport on error.
pub async fn authenticate(
    transport: &Transport,
    auth_key: &DerivedKey,
    wait: Duration,
) -> Result<(), TransportError> {
    time::timeout(wait, run(transport, auth_key, Instant::now() + wait))
        .await
        .map_err(|_| TransportError::AuthTimeout)?
}

async fn run(
    transport: &Transport,
    auth_key: &DerivedKey,
    deadline: Instant,
) -> Result<(), TransportError> {
    let client_nonce: [u8; AUTH_NONCE_LEN] = random_bytes();
    transport
        .send(&encode_msg(&AuthFrame::challenge(client_nonce.to_vec())))
        .await?;
    debug!("sent auth challenge on {}", transport.kind());

    let (proof, daemon_nonce) = match next_step(transport, deadline).await? {
        Step::Response(response) => (response.proof, response.nonce),
        other => return Err(unexpected("response", &other)),
    };

    let expected = auth_key.sign(&[DAEMON_PROOF_LABEL, &client_nonce]);
    if !constant_time_eq(&proof, &expected) {
        warn!("daemon proof did not verify on {}", transport.kind());
        return Err(TransportError::AuthRejected("daemon proof mismatch".into()));
    }
    if daemon_nonce.len() != AUTH_NONCE_LEN {
        return Err(TransportError::Protocol(format!(
            "daemon nonce has {} bytes",
            daemon_nonce.len()
        )));
    }

    let confirm = auth_key.sign(&[CLIENT_PROOF_LABEL, &daemon_nonce]);
    transport
        .send(&encode_msg(&AuthFrame::confirm(confirm.to_vec())))
        .await?;

    match next_step(transport, deadline).await? {
        Step::Result(result) if result.accepted => {
            debug!("daemon accepted auth on {}", transport.kind());
            Ok(())
        }
        Step::Result(result) => Err(TransportError::AuthRejected(if result.reason.is_empty() {
            "rejected by daemon".into()
        } else {
            result.reason
        })),
        other => Err(unexpected("result", &other)),
    }
}

async fn next_step(transport: &Transport, deadline: Instant) -> Result<Step, TransportError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let bytes = transport.receive(remaining).await.map_err(|e| match e {
        TransportError::Timeout => TransportError::AuthTimeout,
        other => other,
    })?;
    let frame: AuthFrame =
        decode_msg(&bytes).map_err(|e| TransportError::Protocol(e.to_string()))?;
    frame
        .step
        .ok_or_else(|| TransportError::Protocol("empty auth frame".into()))
}

fn unexpected(wanted: &str, got: &Step) -> TransportError {
    TransportError::Protocol(format!("expected auth {}, got {:?}", wanted, got))
}
