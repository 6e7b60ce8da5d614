//! Replay protection: timestamp window plus a shared-store nonce guard.
//!
//! Two layers:
//! 1. The event timestamp must fall inside a bounded window around now.
//!    Outside the window the request is dropped silently (no side effects,
//!    204 at the HTTP boundary) so replayed captures reveal nothing.
//! 2. Within the window, the (shop, order key, nonce) triple is consumed via
//!    an atomic set-if-absent with TTL equal to the window, so the same
//!    submission cannot be replayed even while its timestamp is still valid.
//!
//! A store outage fails closed: a nonce that cannot be checked is not
//! accepted.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{SharedStore, StoreError};
use crate::types::{Nonce, OrderKey, ShopId};

/// Default replay window (10 minutes either side of now).
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(600);

/// Result of consuming a nonce.
#[derive(Debug, PartialEq, Eq)]
pub enum NonceVerdict {
    /// First sighting; the nonce is now consumed.
    Fresh,
    /// The same (shop, order key, nonce) was already consumed.
    Replayed,
}

/// Checks that `timestamp` falls within `window` of `now`.
///
/// Both past and future skew are bounded: a timestamp from the future beyond
/// the window is just as suspect as a stale one.
pub fn within_window(timestamp: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let skew = (now - timestamp).num_seconds().unsigned_abs();
    skew <= window.as_secs()
}

/// Consumes a nonce atomically against the shared store.
///
/// Errors propagate so the caller can fail closed; they are never treated
/// as "fresh".
pub async fn consume_nonce(
    store: &dyn SharedStore,
    shop: &ShopId,
    order_key: &OrderKey,
    nonce: &Nonce,
    window: Duration,
) -> Result<NonceVerdict, StoreError> {
    let key = nonce_key(shop, order_key, nonce);
    if store.set_if_absent(&key, "1", window).await? {
        Ok(NonceVerdict::Fresh)
    } else {
        Ok(NonceVerdict::Replayed)
    }
}

fn nonce_key(shop: &ShopId, order_key: &OrderKey, nonce: &Nonce) -> String {
    format!("nonce:{}:{}:{}", shop, order_key, nonce)
}
