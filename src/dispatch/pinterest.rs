//! Pinterest conversions adapter.
//!
//! Events post to `/v5/ad_accounts/<account>/events` with a bearer token.
//! Unlike the float-valued platforms, money goes out in minor currency units
//! (cents) per the API's integer-value convention. The test environment
//! appends `?test=true`, which validates without recording conversions.

use serde_json::json;

use super::{AdapterInput, PreparedRequest, PrepareError, require};
use crate::shop::Environment;
use crate::types::EventType;

fn event_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Purchase => "checkout",
        EventType::BeginCheckout => "custom",
        EventType::AddToCart => "add_to_cart",
        EventType::PageView => "page_visit",
    }
}

/// Converts a major-unit value to integer minor units.
fn minor_units(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

pub(super) fn prepare(input: &AdapterInput<'_>) -> Result<PreparedRequest, PrepareError> {
    let credentials = &input.settings.environment.credentials;
    let account_id = require(&credentials.pixel_id, "pixel_id")?;
    let access_token = require(&credentials.access_token, "access_token")?;

    let contents: Vec<serde_json::Value> = input
        .event
        .items
        .iter()
        .map(|item| {
            json!({
                "id": item.product_id,
                "quantity": item.quantity,
                "item_price": format!("{:.2}", item.price),
            })
        })
        .collect();

    let body = json!({
        "data": [{
            "event_name": event_name(input.event.event_type),
            "action_source": "web",
            "event_time": input.event.timestamp.timestamp(),
            "event_id": input.wire_event_id,
            "custom_data": {
                "value": minor_units(input.event.total_value()),
                "currency": input.event.currency,
                "order_id": input.order_key.as_str(),
                "contents": contents,
            },
        }],
    });

    let mut endpoint = format!("{}/v5/ad_accounts/{account_id}/events", input.base);
    if input.settings.environment.environment == Environment::Test {
        endpoint.push_str("?test=true");
    }

    Ok(PreparedRequest {
        endpoint,
        headers: vec![("Authorization", format!("Bearer {access_token}"))],
        body,
    })
}
