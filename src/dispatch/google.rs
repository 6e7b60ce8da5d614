//! Google measurement-protocol adapter.
//!
//! Events post to `/mp/collect` with the measurement id and API secret as
//! query parameters; the EU-region base is selected by the router from the
//! shop's stored region config. The test environment posts to the
//! validation-only `/debug/mp/collect` endpoint, which never reaches
//! production reporting.

use serde_json::json;

use super::{AdapterInput, PreparedRequest, PrepareError, require};
use crate::shop::Environment;
use crate::types::EventType;

fn event_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Purchase => "purchase",
        EventType::BeginCheckout => "begin_checkout",
        EventType::AddToCart => "add_to_cart",
        EventType::PageView => "page_view",
    }
}

pub(super) fn prepare(input: &AdapterInput<'_>) -> Result<PreparedRequest, PrepareError> {
    let credentials = &input.settings.environment.credentials;
    let measurement_id = require(&credentials.measurement_id, "measurement_id")?;
    let api_secret = require(&credentials.api_secret, "api_secret")?;

    let items: Vec<serde_json::Value> = input
        .event
        .items
        .iter()
        .map(|item| {
            json!({
                "item_id": item.product_id,
                "quantity": item.quantity,
                "price": item.price,
            })
        })
        .collect();

    // The protocol requires a client id; a stable per-event fallback keeps
    // server-originated copies (no session) acceptable.
    let client_id = input
        .event
        .session_id
        .as_deref()
        .unwrap_or(input.wire_event_id);

    let body = json!({
        "client_id": client_id,
        "events": [{
            "name": event_name(input.event.event_type),
            "params": {
                "transaction_id": input.order_key.as_str(),
                "value": input.event.total_value(),
                "currency": input.event.currency,
                "items": items,
            },
        }],
    });

    let path = match input.settings.environment.environment {
        Environment::Live => "/mp/collect",
        Environment::Test => "/debug/mp/collect",
    };

    Ok(PreparedRequest {
        endpoint: format!(
            "{}{path}?measurement_id={measurement_id}&api_secret={api_secret}",
            input.base
        ),
        headers: Vec::new(),
        body,
    })
}
