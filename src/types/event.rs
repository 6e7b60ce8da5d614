//! Internal event shapes shared across the pipeline.
//!
//! The normalizer parses untrusted inbound payloads into [`NormalizedEvent`];
//! everything downstream (dedup, consent, dispatch, ledger) works on this
//! uniform shape and never on raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{Nonce, ShopId};

/// The type of a conversion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A completed purchase. Requires an order id or checkout token.
    Purchase,
    /// Checkout started.
    BeginCheckout,
    /// Item added to cart.
    AddToCart,
    /// Storefront page view (telemetry; never dispatched as a conversion).
    PageView,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Purchase => "purchase",
            EventType::BeginCheckout => "begin_checkout",
            EventType::AddToCart => "add_to_cart",
            EventType::PageView => "page_view",
        }
    }

    /// Parses an inbound event name. Returns `None` for unknown names.
    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "purchase" | "checkout_completed" => Some(EventType::Purchase),
            "begin_checkout" | "checkout_started" => Some(EventType::BeginCheckout),
            "add_to_cart" => Some(EventType::AddToCart),
            "page_view" | "page_viewed" => Some(EventType::PageView),
            _ => None,
        }
    }

    /// Whether events of this type represent money changing hands.
    ///
    /// Purchase events get stricter validation (an order identifier is
    /// mandatory) and are always given a receipt, even when consent filters
    /// out every destination.
    pub fn is_purchase(&self) -> bool {
        matches!(self, EventType::Purchase)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an event copy originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Sent by the storefront pixel running in the buyer's browser.
    Client,
    /// Sent by the commerce platform's server-side webhook.
    Server,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Client => "client",
            EventOrigin::Server => "server",
        }
    }
}

/// Consent signals attached to an inbound event.
///
/// `None` means the signal was absent, which is never treated as consent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentFlags {
    #[serde(default)]
    pub marketing: Option<bool>,
    #[serde(default)]
    pub analytics: Option<bool>,
    #[serde(default, rename = "saleOfData")]
    pub sale_of_data: Option<bool>,
}

/// A purchased line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    #[serde(default)]
    pub variant_id: Option<String>,
    pub quantity: u32,
    /// Unit price in major currency units.
    pub price: f64,
}

/// A fully normalized conversion event.
///
/// This is the uniform internal shape produced by the normalizer. The raw
/// inbound payload is never persisted; only this shape (and the receipts and
/// delivery attempts derived from it) survives the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub shop: ShopId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub origin: EventOrigin,
    pub consent: ConsentFlags,

    /// Numeric order id, unwrapped from any global-id encoding.
    pub order_id: Option<u64>,
    /// Checkout token, used as the order-key fallback.
    pub checkout_token: Option<String>,
    /// Session identifier for events with neither order id nor checkout token.
    pub session_id: Option<String>,

    pub value: Option<f64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub items: Vec<LineItem>,

    pub nonce: Option<Nonce>,
}

impl NormalizedEvent {
    /// Total value of the event, preferring the explicit value over the
    /// line-item sum.
    pub fn total_value(&self) -> f64 {
        self.value.unwrap_or_else(|| {
            self.items
                .iter()
                .map(|item| item.price * f64::from(item.quantity))
                .sum()
        })
    }
}
