//! Inbound payload parsing and batch splitting.
//!
//! Accepts a single event object or a `{"events": [...]}` batch and produces
//! [`NormalizedEvent`]s. The raw payload is untrusted and never persisted;
//! the normalizer is the only place that touches its JSON shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::dedup;
use crate::types::{ConsentFlags, EventOrigin, EventType, LineItem, Nonce, NormalizedEvent, ShopId};

/// Hard cap on request body size.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

/// Hard cap on events per batch request.
pub const MAX_BATCH_LEN: usize = 50;

/// Hard cap on line items per event.
pub const MAX_LINE_ITEMS: usize = 250;

/// Request-level parse failures (reject the whole request).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch of {len} events exceeds the limit of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("batch contains no events")]
    EmptyBatch,
}

/// Per-event validation failures (partial-success model in batches).
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("event has no timestamp")]
    MissingTimestamp,

    #[error("event has {len} line items, limit is {max}")]
    TooManyItems { len: usize, max: usize },
}

/// One raw inbound event, as sent on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub event_name: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shop_domain: Option<String>,
    #[serde(default)]
    pub consent: ConsentFlags,
    #[serde(default)]
    pub data: InboundData,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// The `data` block of an inbound event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundData {
    /// Numeric id or a platform global-id string.
    #[serde(default)]
    pub order_id: Option<serde_json::Value>,
    #[serde(default)]
    pub checkout_token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub items: Vec<LineItem>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBody {
    Batch { events: Vec<InboundEvent> },
    Single(InboundEvent),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Epoch(i64),
    Text(String),
}

/// Accepts RFC 3339 strings and unix-epoch seconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<RawTimestamp>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match raw {
        RawTimestamp::Epoch(secs) => Ok(DateTime::from_timestamp(secs, 0)),
        RawTimestamp::Text(text) => Ok(DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))),
    }
}

/// Parses a request body into individual inbound events.
pub fn parse_payload(bytes: &[u8]) -> Result<Vec<InboundEvent>, ParseError> {
    let events = match serde_json::from_slice::<RawBody>(bytes)? {
        RawBody::Batch { events } => events,
        RawBody::Single(event) => vec![event],
    };

    if events.is_empty() {
        return Err(ParseError::EmptyBatch);
    }
    if events.len() > MAX_BATCH_LEN {
        return Err(ParseError::BatchTooLarge {
            len: events.len(),
            max: MAX_BATCH_LEN,
        });
    }
    Ok(events)
}

/// Normalizes one inbound event into the uniform internal shape.
pub fn normalize(
    inbound: InboundEvent,
    shop: &ShopId,
    origin: EventOrigin,
) -> Result<NormalizedEvent, ValidationError> {
    let event_type = EventType::parse(&inbound.event_name)
        .ok_or_else(|| ValidationError::UnknownEventType(inbound.event_name.clone()))?;
    let timestamp = inbound.timestamp.ok_or(ValidationError::MissingTimestamp)?;

    if inbound.data.items.len() > MAX_LINE_ITEMS {
        return Err(ValidationError::TooManyItems {
            len: inbound.data.items.len(),
            max: MAX_LINE_ITEMS,
        });
    }

    let order_id = match &inbound.data.order_id {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => dedup::unwrap_order_id(s),
        _ => None,
    };

    Ok(NormalizedEvent {
        shop: shop.clone(),
        event_type,
        timestamp,
        origin,
        consent: inbound.consent,
        order_id,
        checkout_token: inbound.data.checkout_token,
        session_id: inbound.data.session_id,
        value: inbound.data.value,
        currency: inbound.data.currency,
        items: inbound.data.items,
        nonce: inbound.nonce.filter(|n| !n.is_empty()).map(Nonce::new),
    })
}
