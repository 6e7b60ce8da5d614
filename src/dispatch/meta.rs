//! Meta conversions-API adapter.
//!
//! Events post to `<base>/<pixel_id>/events` with the access token as a
//! query parameter. Money values are floats in major units. In the test
//! environment the configured `test_event_code` rides along so events land
//! in the pixel's test-events view instead of production reporting.

use serde_json::json;

use super::{AdapterInput, PreparedRequest, PrepareError, require};
use crate::shop::Environment;
use crate::types::EventType;

fn event_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Purchase => "Purchase",
        EventType::BeginCheckout => "InitiateCheckout",
        EventType::AddToCart => "AddToCart",
        EventType::PageView => "PageView",
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
                "id": item.product_id,
                "quantity": item.quantity,
                "item_price": item.price,
            })
        })
        .collect();

    let mut body = json!({
        "data": [{
            "event_name": event_name(input.event.event_type),
            "event_time": input.event.timestamp.timestamp(),
            "event_id": input.wire_event_id,
            "action_source": "website",
            "custom_data": {
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
        endpoint: format!("{}/{pixel_id}/events?access_token={access_token}", input.base),
        headers: Vec::new(),
        body,
    })
}
