//! Admin endpoint for a destination's test/live environment.
//!
//! `POST /api/v1/shops/{shop}/platforms/{platform}/environment` switches a
//! configured destination between environments or rolls back the last
//! switch. Promotion to live is refused with the full list of missing
//! credentials, and every accepted change is persisted through the resolver
//! so running instances pick it up on their next cache miss.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::shop::{Environment, ShopError};
use crate::types::Platform;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EnvironmentAction {
    /// Switch to the given environment, snapshotting the outgoing config.
    Switch { target: Environment },
    /// Restore the config snapshotted by the last switch.
    Rollback,
}

pub async fn environment_handler(
    State(state): State<AppState>,
    Path((shop, platform)): Path<(String, String)>,
    headers: HeaderMap,
    Json(action): Json<EnvironmentAction>,
) -> Response {
    if !super::authorized(&headers, state.admin_secrets()) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let Some(platform) = Platform::parse(&platform) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown platform: {platform}")})),
        )
            .into_response();
    };

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

    let mut record = (*record).clone();
    let Some(settings) = record.platforms.get_mut(&platform) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("{platform} is not configured for {shop}")})),
        )
            .into_response();
    };

    match action {
        EnvironmentAction::Switch { target } => {
            if let Err(err) = settings.environment.switch_to(platform, target) {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({"error": err.to_string(), "missing": err.missing})),
                )
                    .into_response();
            }
        }
        EnvironmentAction::Rollback => {
            if !settings.environment.rollback() {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({"error": "nothing to roll back"})),
                )
                    .into_response();
            }
        }
    }

    let environment = settings.environment.environment;
    let version = settings.environment.version;
    if let Err(err) = state.pipeline().resolver().save(&record).await {
        warn!(shop = %record.domain, error = %err, "failed to persist environment change");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response();
    }

    info!(
        shop = %record.domain,
        platform = %platform,
        environment = environment.as_str(),
        version,
        "environment changed"
    );
    (
        StatusCode::OK,
        Json(json!({
            "platform": platform.as_str(),
            "environment": environment.as_str(),
            "version": version,
        })),
    )
        .into_response()
}
