//! Ingestion endpoint handler.
//!
//! Runs the pipeline synchronously by default and returns per-event
//! outcomes. With `?mode=async` the raw request is spooled durably and a 202
//! is returned immediately; the drain task feeds it through the same
//! pipeline later.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::ingest::{EventOutcome, IngestRequest, Rejection};
use crate::worker::queue;

/// Header carrying the shop domain. The first event's `shopDomain` field is
/// the fallback.
pub const HEADER_SHOP_DOMAIN: &str = "x-shop-domain";
/// Header carrying the HMAC signature (`sha256=<hex>`).
pub const HEADER_SIGNATURE: &str = "x-relay-signature";

#[derive(Debug, Default, Deserialize)]
pub struct IngestQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

/// Maps a pipeline rejection onto an HTTP response.
pub struct ApiRejection(pub Rejection);

impl From<Rejection> for ApiRejection {
    fn from(rejection: Rejection) -> Self {
        ApiRejection(rejection)
    }
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Rejection::UnknownShop | Rejection::InactiveShop => StatusCode::UNAUTHORIZED,
            Rejection::Malformed(_) | Rejection::MissingShopDomain => StatusCode::BAD_REQUEST,
            Rejection::SignatureRejected | Rejection::OriginRejected(_) => StatusCode::FORBIDDEN,
            Rejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Rejection::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

pub async fn ingest_handler(
    State(state): State<AppState>,
    Query(query): Query<IngestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiRejection> {
    let shop_domain = header_value(&headers, HEADER_SHOP_DOMAIN);
    let origin = header_value(&headers, "origin");
    let referer = header_value(&headers, "referer");
    let signature = header_value(&headers, HEADER_SIGNATURE);

    if query.mode.as_deref() == Some("async") {
        return accept_async(&state, &body, shop_domain, origin, referer, signature);
    }

    let outcomes = state
        .pipeline()
        .ingest(IngestRequest {
            body: body.to_vec(),
            shop_domain,
            origin,
            referer,
            signature,
        })
        .await?;

    // A single stale event was silently dropped; nothing to report.
    if outcomes.iter().all(|o| *o == EventOutcome::Stale) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    // Every event hit the replay guard: the whole request is a replay.
    // Mixed batches stay 200 under the partial-success model.
    if outcomes.iter().all(|o| *o == EventOutcome::NonceReplayed) {
        return Ok((StatusCode::FORBIDDEN, Json(json!({"results": outcomes}))).into_response());
    }

    Ok((StatusCode::OK, Json(json!({"results": outcomes}))).into_response())
}

/// Spools the raw request for the drain task. Signature verification is
/// deferred to drain time, which is why the body is kept byte-exact.
fn accept_async(
    state: &AppState,
    body: &Bytes,
    shop_domain: Option<String>,
    origin: Option<String>,
    referer: Option<String>,
    signature: Option<String>,
) -> Result<Response, ApiRejection> {
    let body = String::from_utf8(body.to_vec())
        .map_err(|_| Rejection::Malformed("body is not UTF-8".into()))?;

    let request = queue::queued_request(body, shop_domain, origin, referer, signature);
    if let Err(err) = state.queue().enqueue(&request) {
        warn!(error = %err, "failed to spool async request");
        return Err(Rejection::Internal(err.to_string()).into());
    }

    info!(request_id = %request.id, "request spooled for async processing");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"queued": true, "requestId": request.id})),
    )
        .into_response())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
