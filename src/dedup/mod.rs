//! Order-match keys and deterministic event ids.
//!
//! Every event is reduced to a canonical identity before anything is
//! persisted or dispatched:
//!
//! - The **order key** collapses the several ways an order can be referenced
//!   (numeric id, global-id encoding, checkout token) into one stable string.
//!   Preference order: numeric order id, then a hash of the checkout token,
//!   then a session-scoped synthetic key for events with neither.
//! - The **event id** is a full SHA-256 hex digest over the normalized
//!   identity, so a client-sent and a server-sent copy of the same logical
//!   event collapse to one id. This full-digest form is the single canonical
//!   scheme; a truncated variant exists only as the display helper
//!   [`crate::types::EventId::short`].
//!
//! The id sent on the wire to each destination is additionally scoped by the
//! platform tag, giving each destination a stable identifier for its own
//! dedup logic.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{EventId, EventType, NormalizedEvent, OrderKey, Platform};

/// Errors deriving an event identity.
#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    /// Purchase events must reference an order id or a checkout token.
    #[error("purchase event carries neither order id nor checkout token")]
    PurchaseWithoutOrder,

    /// Non-purchase events need at least a session id to form a key.
    #[error("event carries no order, checkout, or session identifier")]
    NoIdentity,
}

/// Result type for key derivation.
pub type Result<T> = std::result::Result<T, KeyError>;

/// The derived identity keys for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKeys {
    /// Canonical order key.
    pub order_key: OrderKey,
    /// Secondary key when the event carries both an order id and a checkout
    /// token; lets a token-keyed copy match an id-keyed receipt.
    pub alt_order_key: Option<OrderKey>,
}

/// Unwraps a numeric order id from a raw identifier.
///
/// Accepts plain integers ("1001") and global-id encodings
/// ("gid://shopify/Order/1001", with or without query parameters).
pub fn unwrap_order_id(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Ok(id) = trimmed.parse::<u64>() {
        return Some(id);
    }

    // gid://<app>/Order/<id>[?params]
    let last_segment = trimmed.rsplit('/').next()?;
    let digits = last_segment.split('?').next()?;
    digits.parse::<u64>().ok()
}

/// Derives the canonical order key (and alt key) for an event.
pub fn derive_match_keys(event: &NormalizedEvent) -> Result<MatchKeys> {
    let checkout_key = event
        .checkout_token
        .as_deref()
        .map(|token| OrderKey::new(format!("chk_{}", short_hash(token.as_bytes()))));

    if let Some(order_id) = event.order_id {
        return Ok(MatchKeys {
            order_key: OrderKey::new(order_id.to_string()),
            alt_order_key: checkout_key,
        });
    }

    if let Some(key) = checkout_key {
        return Ok(MatchKeys {
            order_key: key,
            alt_order_key: None,
        });
    }

    if event.event_type.is_purchase() {
        return Err(KeyError::PurchaseWithoutOrder);
    }

    match event.session_id.as_deref() {
        Some(session) => Ok(MatchKeys {
            order_key: OrderKey::new(format!("sess_{session}")),
            alt_order_key: None,
        }),
        None => Err(KeyError::NoIdentity),
    }
}

/// Computes the canonical event id: a full SHA-256 hex digest over the
/// normalized identity.
///
/// Components are joined with a separator no component may contain, so two
/// different identities can never concatenate to the same digest input.
pub fn canonical_event_id(event: &NormalizedEvent, keys: &MatchKeys) -> EventId {
    let fingerprint = line_item_fingerprint(event);
    let nonce = event.nonce.as_ref().map(|n| n.as_str()).unwrap_or("-");

    let input = format!(
        "v1\n{}\n{}\n{}\n{}",
        keys.order_key,
        event.event_type,
        fingerprint.as_deref().unwrap_or("-"),
        nonce,
    );
    EventId::new(hex::encode(Sha256::digest(input.as_bytes())))
}

/// The stable identifier sent on the wire to one destination.
///
/// Scoping by platform keeps each destination's dedup window independent
/// while remaining deterministic across retries.
pub fn platform_event_id(event_id: &EventId, platform: Platform) -> String {
    format!("{}_{}", event_id.as_str(), platform.as_str())
}

/// Fingerprints the line items: order-insensitive, quantity-sensitive.
///
/// Returns `None` for events without items so their identity doesn't depend
/// on an empty-list sentinel.
pub fn line_item_fingerprint(event: &NormalizedEvent) -> Option<String> {
    if event.items.is_empty() {
        return None;
    }

    let mut entries: Vec<String> = event
        .items
        .iter()
        .map(|item| {
            format!(
                "{}:{}:{}",
                item.product_id,
                item.variant_id.as_deref().unwrap_or("-"),
                item.quantity
            )
        })
        .collect();
    entries.sort();

    Some(short_hash(entries.join(",").as_bytes()))
}

/// Whether this event type requires a durable receipt even when no platform
/// ends up receiving it.
pub fn requires_receipt(event_type: EventType) -> bool {
    event_type.is_purchase()
}

fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}
