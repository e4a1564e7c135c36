//! HMAC verification for gate callbacks.
//!
//! Workflows sign every callback as
//! `HMAC-SHA256(secret, "{timestamp}.{rawBody}")` and send the hex digest
//! in `X-N8n-Signature` plus the unix-seconds timestamp in
//! `X-N8n-Timestamp`. Signatures older (or newer) than five minutes are
//! rejected; the digest comparison is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew between the caller and the relay.
pub const MAX_SKEW_SECS: i64 = 300;

pub const SIGNATURE_HEADER: &str = "x-n8n-signature";
pub const TIMESTAMP_HEADER: &str = "x-n8n-timestamp";

/// Verify a callback signature. `now_unix` is injected for testability.
pub fn verify_signature(
    secret: &str,
    signature_hex: &str,
    timestamp: &str,
    body: &[u8],
    now_unix: i64,
) -> Result<(), &'static str> {
    let ts: i64 = timestamp.parse().map_err(|_| "invalid timestamp")?;
    if (now_unix - ts).abs() > MAX_SKEW_SECS {
        return Err("timestamp outside allowed window");
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected.len() != signature_hex.len() {
        return Err("signature length mismatch");
    }
    // Constant-time comparison to prevent timing attacks.
    if expected.as_bytes().ct_eq(signature_hex.as_bytes()).unwrap_u8() != 1 {
        return Err("signature mismatch");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"tool_call_id":"tc_1","status":"PREPARING"}"#;
        let sig = sign("secret", "1700000000", body);
        assert!(verify_signature("secret", &sig, "1700000000", body, 1_700_000_010).is_ok());
    }

    #[test]
    fn flipped_body_bit_rejected() {
        let body = br#"{"tool_call_id":"tc_1"}"#;
        let sig = sign("secret", "1700000000", body);
        let tampered = br#"{"tool_call_id":"tc_2"}"#;
        assert_eq!(
            verify_signature("secret", &sig, "1700000000", tampered, 1_700_000_010),
            Err("signature mismatch")
        );
    }

    #[test]
    fn altered_timestamp_rejected() {
        let body = b"{}";
        let sig = sign("secret", "1700000000", body);
        // Same signature, different claimed timestamp.
        assert!(verify_signature("secret", &sig, "1700000001", body, 1_700_000_010).is_err());
    }

    #[test]
    fn stale_timestamp_rejected() {
        let body = b"{}";
        let ts = "1700000000";
        let sig = sign("secret", ts, body);
        assert_eq!(
            verify_signature("secret", &sig, ts, body, 1_700_000_000 + MAX_SKEW_SECS + 1),
            Err("timestamp outside allowed window")
        );
        // Future timestamps beyond the window are equally invalid.
        assert_eq!(
            verify_signature("secret", &sig, ts, body, 1_700_000_000 - MAX_SKEW_SECS - 1),
            Err("timestamp outside allowed window")
        );
    }

    #[test]
    fn boundary_skew_is_accepted() {
        let body = b"{}";
        let ts = "1700000000";
        let sig = sign("secret", ts, body);
        assert!(verify_signature("secret", &sig, ts, body, 1_700_000_000 + MAX_SKEW_SECS).is_ok());
    }

    #[test]
    fn length_mismatch_rejected() {
        assert_eq!(
            verify_signature("secret", "abc", "1700000000", b"{}", 1_700_000_000),
            Err("signature length mismatch")
        );
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = b"{}";
        let sig = sign("other-secret", "1700000000", body);
        assert_eq!(
            verify_signature("secret", &sig, "1700000000", body, 1_700_000_000),
            Err("signature mismatch")
        );
    }

    #[test]
    fn garbage_timestamp_rejected() {
        assert_eq!(
            verify_signature("secret", "00", "yesterday", b"{}", 1_700_000_000),
            Err("invalid timestamp")
        );
    }
}
