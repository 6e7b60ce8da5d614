//! Request authentication: origin pre-check, HMAC verification with secret
//! rotation, replay protection, and trust classification.
//!
//! The authenticator never parses business fields; it works on the raw body,
//! the headers, and the resolved shop record, and produces a
//! [`TrustLevel`] that the pipeline acts on under the shop's strict/lenient
//! policy.

pub mod origin;
pub mod replay;
pub mod signature;

pub use origin::{OriginVerdict, check_origin};
pub use replay::{DEFAULT_REPLAY_WINDOW, NonceVerdict, consume_nonce, within_window};
pub use signature::{
    SignatureVerdict, compute_signature, format_signature_header, parse_signature_header,
    verify_signature, verify_with_rotation,
};

use serde::{Deserialize, Serialize};

/// How strongly a request's authenticity could be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Verified HMAC signature (current or previous secret).
    Trusted,
    /// Unsigned but acceptable: the shop opted out of signatures, or the
    /// event is non-purchase telemetry.
    Partial,
    /// Signature invalid, or missing where one was required.
    Untrusted,
}

/// Classifies a request's trust level.
///
/// Trusted requires a verified signature. Partial covers signature-skipped
/// configurations and unsigned non-purchase telemetry. Everything else is
/// untrusted; whether untrusted requests are dropped or passed through is
/// the shop's strict/lenient policy, decided by the caller.
pub fn classify_trust(
    signature: SignatureVerdict,
    signature_optional: bool,
    is_purchase: bool,
) -> TrustLevel {
    if signature.is_verified() {
        return TrustLevel::Trusted;
    }
    match signature {
        SignatureVerdict::Missing if signature_optional || !is_purchase => TrustLevel::Partial,
        _ => TrustLevel::Untrusted,
    }
}

/// Whether an origin verdict permits the request to continue.
///
/// Strict deployments reject any mismatch. Lenient deployments exempt
/// HMAC-verified requests from origin rejection.
pub fn origin_permits(origin: &OriginVerdict, signature: SignatureVerdict, strict: bool) -> bool {
    match origin {
        OriginVerdict::Allowed | OriginVerdict::Absent => true,
        OriginVerdict::Mismatch(_) => !strict && signature.is_verified(),
    }
}
