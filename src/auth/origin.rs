//! Origin/referer pre-check for ingestion requests.
//!
//! Browser-originated events must come from the shop's own domain, one of
//! its storefront domains, or the commerce platform's hosted checkout
//! domains. This is a cheap pre-filter, not authentication: HMAC-verified
//! requests may be exempted from strict origin rejection in lenient
//! deployments, and server-originated webhooks carry no Origin at all.

use url::Url;

use crate::shop::ShopRecord;

/// Hosted-checkout domain suffixes accepted for any shop.
const HOSTED_DOMAIN_SUFFIXES: &[&str] = &["myshopify.com", "shopify.com", "shop.app"];

/// Result of the origin pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginVerdict {
    /// Origin matches the shop or a hosted domain.
    Allowed,
    /// No Origin or Referer header (typical for server-to-server calls).
    Absent,
    /// Origin present but matches nothing configured for the shop.
    Mismatch(String),
}

impl OriginVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OriginVerdict::Allowed | OriginVerdict::Absent)
    }
}

/// Checks the Origin header (falling back to Referer) against the shop.
pub fn check_origin(
    origin: Option<&str>,
    referer: Option<&str>,
    shop: &ShopRecord,
) -> OriginVerdict {
    let Some(raw) = origin.or(referer) else {
        return OriginVerdict::Absent;
    };

    match extract_host(raw) {
        Some(host) if host_allowed(&host, shop) => OriginVerdict::Allowed,
        Some(host) => OriginVerdict::Mismatch(host),
        // An unparseable Origin is treated like a mismatching one.
        None => OriginVerdict::Mismatch(raw.to_string()),
    }
}

fn host_allowed(host: &str, shop: &ShopRecord) -> bool {
    if host.eq_ignore_ascii_case(&shop.domain) {
        return true;
    }
    if shop
        .storefront_domains
        .iter()
        .any(|d| host.eq_ignore_ascii_case(d))
    {
        return true;
    }
    HOSTED_DOMAIN_SUFFIXES.iter().any(|suffix| {
        host.eq_ignore_ascii_case(suffix)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{suffix}"))
    })
}

/// Extracts the host from an Origin/Referer value.
///
/// Accepts both full URLs ("https://shop.example/cart") and bare origins
/// ("https://shop.example").
fn extract_host(value: &str) -> Option<String> {
    Url::parse(value)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}
