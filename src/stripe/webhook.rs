use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window for signed webhooks, in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,

    #[error("malformed signature header")]
    Malformed,

    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,

    #[error("no signature matched")]
    Mismatch,
}

/// Verify a Stripe webhook signature against the current clock
///
/// The header has the form `t=<unix>,v1=<hex>[,v1=<hex>...]`; several `v1`
/// entries are present while a secret is being rolled.
pub fn verify_webhook_signature(
    raw_body: &[u8],
    signature_header: Option<&str>,
    webhook_secret: &str,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    verify_webhook_signature_at(
        raw_body,
        signature_header,
        webhook_secret,
        tolerance_secs,
        chrono::Utc::now().timestamp(),
    )
}

/// Verify a signature against an explicit `now` (unix seconds)
pub fn verify_webhook_signature_at(
    raw_body: &[u8],
    signature_header: Option<&str>,
    webhook_secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let header = signature_header.ok_or(SignatureError::MissingHeader)?;

    let mut timestamp: Option<&str> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("t=") {
            timestamp = Some(value);
        } else if let Some(value) = part.strip_prefix("v1=") {
            candidates.push(value);
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let webhook_time = timestamp
        .parse::<i64>()
        .map_err(|_| SignatureError::Malformed)?;
    // abs_diff cannot overflow for extreme timestamps
    if now.abs_diff(webhook_time) > tolerance_secs.unsigned_abs() {
        return Err(SignatureError::TimestampOutOfTolerance);
    }

    for candidate in candidates {
        let Ok(received) = hex::decode(candidate) else {
            continue;
        };
        let mac = signed_payload_mac(webhook_secret, timestamp, raw_body)?;
        // verify_slice compares in constant time
        if mac.verify_slice(&received).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

/// Compute the `v1` signature for a payload. Used to sign test fixtures.
pub fn compute_signature(
    webhook_secret: &str,
    timestamp: i64,
    raw_body: &[u8],
) -> Result<String, SignatureError> {
    let mac = signed_payload_mac(webhook_secret, &timestamp.to_string(), raw_body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a complete signature header for a payload
pub fn signature_header(
    webhook_secret: &str,
    timestamp: i64,
    raw_body: &[u8],
) -> Result<String, SignatureError> {
    let signature = compute_signature(webhook_secret, timestamp, raw_body)?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

fn signed_payload_mac(
    webhook_secret: &str,
    timestamp: &str,
    raw_body: &[u8],
) -> Result<HmacSha256, SignatureError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{}}}"#;

    #[test]
    fn test_webhook_signature_verification() {
        let now = 1_700_000_000;
        let header = signature_header(SECRET, now, BODY).unwrap();
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(&header), SECRET, 300, now),
            Ok(())
        );
    }

    #[test]
    fn test_webhook_signature_verification_invalid() {
        let header = "t=1700000000,v1=deadbeef";
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(header), SECRET, 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_webhook_signature_verification_expired() {
        let signed_at = 1_000_000;
        let header = signature_header(SECRET, signed_at, BODY).unwrap();
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(&header), SECRET, 300, signed_at + 301),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn test_extreme_timestamps_rejected_without_overflow() {
        let now = 1_700_000_000;
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1={}", t, "00".repeat(32));
            assert_eq!(
                verify_webhook_signature_at(BODY, Some(&header), SECRET, 300, now),
                Err(SignatureError::TimestampOutOfTolerance)
            );
        }
        let header = format!("t={},v1=00", i64::MIN);
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(&header), SECRET, i64::MIN, i64::MAX),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let signed_at = 1_000_000;
        let header = signature_header(SECRET, signed_at, BODY).unwrap();
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(&header), SECRET, 300, signed_at + 300),
            Ok(())
        );
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(&header), SECRET, 300, signed_at - 300),
            Ok(())
        );
    }

    #[test]
    fn test_tampered_body_rejected() {
        let now = 1_700_000_000;
        let header = signature_header(SECRET, now, BODY).unwrap();
        let tampered = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"amount":1}}}"#;
        assert_eq!(
            verify_webhook_signature_at(tampered, Some(&header), SECRET, 300, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_rolled_secret_second_candidate_matches() {
        let now = 1_700_000_000;
        let good = compute_signature(SECRET, now, BODY).unwrap();
        let header = format!("t={},v1={},v1={}", now, "00".repeat(32), good);
        assert_eq!(
            verify_webhook_signature_at(BODY, Some(&header), SECRET, 300, now),
            Ok(())
        );
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        assert_eq!(
            verify_webhook_signature_at(BODY, None, SECRET, 300, 0),
            Err(SignatureError::MissingHeader)
        );
        assert_eq!(
            verify_webhook_signature_at(BODY, Some("v1=abc"), SECRET, 300, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_webhook_signature_at(BODY, Some("t=notanumber,v1=abc"), SECRET, 300, 0),
            Err(SignatureError::Malformed)
        );
    }
}
