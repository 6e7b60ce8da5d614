//! TikTok events-API adapter.
//!
//! Events post to `/open_api/v1.3/event/track/` with the access token in an
//! `Access-Token` header. TikTok reports failures inside a 200 body
//! (`code != 0`); the router classifies those after the call.

use serde_json::json;

use super::{AdapterInput, PreparedRequest, PrepareError, require};
use crate::shop::Environment;
use crate::types::EventType;

fn event_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Purchase => "CompletePayment",
        EventType::BeginCheckout => "InitiateCheckout",
        EventType::AddToCart => "AddToCart",
        EventType::PageView => "Pageview",
    }
}

pub(super) fn prepare(input: &AdapterInput<'_>) -> Result<PreparedRequest, PrepareError> {
    let credentials = &input.settings.environment.credentials;
    let pixel_id = require(&credentials.pixel_id, "pixel_id")?;
    let access_token = require(&credentials.access_token, "access_token")?;

    let contents: Vec<serde_json::Value> = input
        .event
        .items
        .iter()
        .map(|item| {
            json!({
                "content_id": item.product_id,
                "quantity": item.quantity,
                "price": item.price,
            })
        })
        .collect();

    let mut body = json!({
        "event_source": "web",
        "event_source_id": pixel_id,
        "data": [{
            "event": event_name(input.event.event_type),
            "event_time": input.event.timestamp.timestamp(),
            "event_id": input.wire_event_id,
            "properties": {
                "value": input.event.total_value(),
                "currency": input.event.currency,
                "order_id": input.order_key.as_str(),
                "content_type": "product",
                "contents": contents,
            },
        }],
    });

    if input.settings.environment.environment == Environment::Test
        && let Some(code) = &credentials.test_event_code
    {
        body["test_event_code"] = json!(code);
    }

    Ok(PreparedRequest {
        endpoint: format!("{}/open_api/v1.3/event/track/", input.base),
        headers: vec![("Access-Token", access_token.to_string())],
        body,
    })
}
