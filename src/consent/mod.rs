//! Consent filtering: reduces a shop's configured platform set to the
//! destinations the event's consent signals permit.
//!
//! Consent is opt-in throughout: an absent flag is never treated as
//! permission. Sale-of-data is a hard gate on top of the marketing/analytics
//! rule, so a platform that requires it is excluded unless the flag is
//! explicitly true.

use serde::Serialize;

use crate::shop::PlatformSettings;
use crate::types::{ConsentFlags, Platform};

/// Why a platform was skipped for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Server-side delivery is disabled for this platform.
    ServerSideDisabled,
    /// The platform is marketing-gated and marketing consent was not given.
    NoMarketingConsent,
    /// The platform accepts analytics traffic but analytics consent was not
    /// given (and marketing consent was not given either).
    NoAnalyticsConsent,
    /// The platform requires sale-of-data consent and it was not explicitly
    /// granted.
    SaleOfDataDenied,
}

/// One filtering decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedPlatform {
    pub platform: Platform,
    pub reason: SkipReason,
}

/// The outcome of filtering one event against a shop's platform config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsentDecision {
    pub included: Vec<Platform>,
    pub skipped: Vec<SkippedPlatform>,
}

impl ConsentDecision {
    /// Counts for structured logging: (configured, included, skipped).
    pub fn metrics(&self) -> (usize, usize, usize) {
        let included = self.included.len();
        let skipped = self.skipped.len();
        (included + skipped, included, skipped)
    }
}

/// Filters the configured platforms for one event.
///
/// `platforms` is the shop's configured set in a stable order; the decision
/// preserves that order so logs and attempts are deterministic.
pub fn filter_platforms(
    consent: &ConsentFlags,
    platforms: &[(Platform, PlatformSettings)],
) -> ConsentDecision {
    let mut decision = ConsentDecision::default();

    for (platform, settings) in platforms {
        match evaluate(consent, settings) {
            None => decision.included.push(*platform),
            Some(reason) => decision.skipped.push(SkippedPlatform {
                platform: *platform,
                reason,
            }),
        }
    }

    decision
}

/// Evaluates one platform; `None` means include.
fn evaluate(consent: &ConsentFlags, settings: &PlatformSettings) -> Option<SkipReason> {
    if !settings.server_side_enabled {
        return Some(SkipReason::ServerSideDisabled);
    }

    // Sale-of-data is checked first: it is a hard exclusion that marketing
    // consent cannot override.
    if settings.requires_sale_of_data && consent.sale_of_data != Some(true) {
        return Some(SkipReason::SaleOfDataDenied);
    }

    let marketing = consent.marketing == Some(true);
    let analytics = consent.analytics == Some(true);

    if marketing {
        return None;
    }
    if settings.treat_as_marketing {
        return Some(SkipReason::NoMarketingConsent);
    }
    if analytics {
        return None;
    }
    Some(SkipReason::NoAnalyticsConsent)
}
