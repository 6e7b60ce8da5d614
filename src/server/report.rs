//! Reconciliation report endpoint.
//!
//! Optional `from`/`to` query parameters (RFC 3339) scope the report to a
//! time window; omitting both reconciles everything on record.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::reconcile::{self, DEFAULT_DELAY_THRESHOLD, TimeWindow};
use crate::shop::ShopError;
use crate::types::ShopId;

pub async fn reconciliation_handler(
    State(state): State<AppState>,
    Path(shop): Path<String>,
    Query(window): Query<TimeWindow>,
    headers: HeaderMap,
) -> Response {
    if !super::authorized(&headers, state.admin_secrets()) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let record = match state.pipeline().resolver().resolve(&shop).await {
        Ok(record) => record,
        Err(ShopError::Unknown(_) | ShopError::Inactive(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("no active shop: {shop}")})),
            )
                .into_response();
        }
        Err(err) => {
            warn!(shop, error = %err, "shop record unreadable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    let shop_id = ShopId::new(shop);
    let orders = match reconcile::load_orders(state.data_dir(), &shop_id) {
        Ok(orders) => orders,
        Err(err) => {
            warn!(shop = %shop_id, error = %err, "order snapshot unreadable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };
    let attempts = match state.pipeline().ledger().read_attempts(&shop_id) {
        Ok(attempts) => attempts,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    let report = reconcile::reconcile(
        &shop_id,
        &orders,
        &attempts,
        &record.configured_platforms(),
        window,
        DEFAULT_DELAY_THRESHOLD,
    );
    (StatusCode::OK, Json(report)).into_response()
}
