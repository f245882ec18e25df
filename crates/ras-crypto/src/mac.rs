//! HMAC-SHA256 proofs and constant-time comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tag.
pub const MAC_LEN: usize = 32;

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; MAC_LEN] {
    hmac_sha256_parts(key, &[message])
}

/// HMAC-SHA256 of the concatenation of `parts` under `key`.
pub fn hmac_sha256_parts(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Recompute the HMAC of `message` and compare it to `expected` in constant time.
pub fn verify_hmac(key: &[u8], message: &[u8], expected: &[u8]) -> bool {
    constant_time_eq(&hmac_sha256(key, message), expected)
}

/// Constant-time byte comparison.
///
/// Runs over the full length regardless of where the first mismatch is.
/// Returns `false` on length mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_parts_match_concatenation() {
        let key = [1u8; 32];
        let whole = hmac_sha256(&key, b"session-1device-9nonce");
        let parts = hmac_sha256_parts(&key, &[b"session-1", b"device-9", b"nonce"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_verify_hmac() {
        let key = [5u8; 32];
        let tag = hmac_sha256(&key, b"message");
        assert!(verify_hmac(&key, b"message", &tag));
        assert!(!verify_hmac(&key, b"messagf", &tag));
        assert!(!verify_hmac(&[6u8; 32], b"message", &tag));
        assert!(!verify_hmac(&key, b"message", &tag[..31]));
    }

    #[test]
    fn test_constant_time_eq_identical() {
        assert!(constant_time_eq(b"token123", b"token123"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq(b"token123", b"token124"));
        assert!(!constant_time_eq(b"Xoken123", b"token123"));
    }

    #[test]
    fn test_constant_time_eq_length_mismatch_is_false() {
        assert!(!constant_time_eq(b"short", b"much_longer_value"));
        assert!(!constant_time_eq(b"a", b""));
    }
}
