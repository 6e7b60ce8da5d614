//! Ingestion signature verification using HMAC-SHA256.
//!
//! Requests are signed over the raw body with the shop's ingestion secret;
//! the signature arrives in the `X-Relay-Signature` header as
//! `sha256=<hex>`. During secret rotation, a request signed with the
//! previous secret still verifies ("grace window") so rotating credentials
//! never drops live traffic.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::shop::IngestionSecrets;

type HmacSha256 = Hmac<Sha256>;

/// Which secret, if any, verified the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    /// Verified against the current secret.
    Current,
    /// Verified against the previous secret (rotation grace window).
    Previous,
    /// Present but verified against neither secret.
    Invalid,
    /// No signature header was sent.
    Missing,
}

impl SignatureVerdict {
    /// Whether the body was authenticated by either configured secret.
    pub fn is_verified(&self) -> bool {
        matches!(self, SignatureVerdict::Current | SignatureVerdict::Previous)
    }
}

/// Parses a signature header (e.g., "sha256=abc123...") into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex, etc.).
/// Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
///
/// Used by tests and by the task-trigger client examples to generate
/// expected signatures.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a header value (`sha256=<hex>`).
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a signature against the payload and a single secret.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected_signature = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&expected_signature).is_ok()
}

/// Verifies a signature against the current secret, falling back to the
/// previous secret when one is configured.
pub fn verify_with_rotation(
    payload: &[u8],
    signature_header: Option<&str>,
    secrets: &IngestionSecrets,
) -> SignatureVerdict {
    let Some(header) = signature_header else {
        return SignatureVerdict::Missing;
    };

    if verify_signature(payload, header, secrets.current.as_bytes()) {
        return SignatureVerdict::Current;
    }
    if let Some(previous) = &secrets.previous
        && verify_signature(payload, header, previous.as_bytes())
    {
        return SignatureVerdict::Previous;
    }
    SignatureVerdict::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secrets(current: &str, previous: Option<&str>) -> IngestionSecrets {
        IngestionSecrets {
            current: current.to_string(),
            previous: previous.map(String::from),
        }
    }

    #[test]
    fn parse_signature_header_valid() {
        let result = parse_signature_header("sha256=1234abcd");
        assert_eq!(result, Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn parse_signature_header_rejects_malformed() {
        assert_eq!(parse_signature_header("1234abcd"), None);
        assert_eq!(parse_signature_header("sha1=1234abcd"), None);
        assert_eq!(parse_signature_header("sha256=xyz"), None);
        assert_eq!(parse_signature_header("sha256=abc"), None);
        assert_eq!(parse_signature_header(""), None);
    }

    #[test]
    fn verify_signature_wrong_secret_fails() {
        let payload = b"test payload";
        let sig = compute_signature(payload, b"correct-secret");
        let header = format_signature_header(&sig);

        assert!(verify_signature(payload, &header, b"correct-secret"));
        assert!(!verify_signature(payload, &header, b"wrong-secret"));
    }

    #[test]
    fn current_secret_verifies_as_current() {
        let payload = b"{}";
        let secrets = secrets("new-secret", Some("old-secret"));
        let header = format_signature_header(&compute_signature(payload, b"new-secret"));

        assert_eq!(
            verify_with_rotation(payload, Some(&header), &secrets),
            SignatureVerdict::Current
        );
    }

    #[test]
    fn previous_secret_verifies_during_grace_window() {
        let payload = b"{}";
        let header = format_signature_header(&compute_signature(payload, b"old-secret"));

        let rotating = secrets("new-secret", Some("old-secret"));
        assert_eq!(
            verify_with_rotation(payload, Some(&header), &rotating),
            SignatureVerdict::Previous
        );
    }

    #[test]
    fn previous_secret_rejected_after_rotation_completes() {
        let payload = b"{}";
        let header = format_signature_header(&compute_signature(payload, b"old-secret"));

        let rotated = secrets("new-secret", None);
        assert_eq!(
            verify_with_rotation(payload, Some(&header), &rotated),
            SignatureVerdict::Invalid
        );
    }

    #[test]
    fn missing_header_is_distinct_from_invalid() {
        let payload = b"{}";
        let secrets = secrets("secret", None);

        assert_eq!(
            verify_with_rotation(payload, None, &secrets),
            SignatureVerdict::Missing
        );
        assert_eq!(
            verify_with_rotation(payload, Some("sha256=00"), &secrets),
            SignatureVerdict::Invalid
        );
    }

    proptest! {
        /// Signing and verifying with the same secret always succeeds.
        #[test]
        fn prop_sign_verify_roundtrip(payload: Vec<u8>, secret: Vec<u8>) {
            let sig = compute_signature(&payload, &secret);
            let header = format_signature_header(&sig);
            prop_assert!(verify_signature(&payload, &header, &secret));
        }

        /// Verifying with a different secret always fails.
        #[test]
        fn prop_wrong_secret_fails(payload: Vec<u8>, secret1: Vec<u8>, secret2: Vec<u8>) {
            prop_assume!(secret1 != secret2);
            let sig = compute_signature(&payload, &secret1);
            let header = format_signature_header(&sig);
            prop_assert!(!verify_signature(&payload, &header, &secret2));
        }

        /// Any modification to the payload causes verification to fail.
        #[test]
        fn prop_modified_payload_fails(original: Vec<u8>, modified: Vec<u8>, secret: Vec<u8>) {
            prop_assume!(original != modified);
            let sig = compute_signature(&original, &secret);
            let header = format_signature_header(&sig);
            prop_assert!(!verify_signature(&modified, &header, &secret));
        }

        /// Malformed headers never cause a panic.
        #[test]
        fn prop_malformed_header_no_panic(header: String, payload: Vec<u8>, secret: Vec<u8>) {
            let _ = parse_signature_header(&header);
            let _ = verify_signature(&payload, &header, &secret);
        }

        /// Rotation verification agrees with single-secret verification.
        #[test]
        fn prop_rotation_matches_single_secret(payload: Vec<u8>, current: String, previous: String) {
            prop_assume!(!current.is_empty() && !previous.is_empty());
            let both = IngestionSecrets {
                current: current.clone(),
                previous: Some(previous.clone()),
            };

            let header = format_signature_header(&compute_signature(&payload, current.as_bytes()));
            prop_assert!(verify_with_rotation(&payload, Some(&header), &both).is_verified());

            let header = format_signature_header(&compute_signature(&payload, previous.as_bytes()));
            prop_assert!(verify_with_rotation(&payload, Some(&header), &both).is_verified());
        }
    }
}
