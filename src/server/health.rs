//! Health endpoint for liveness probes.

use axum::http::StatusCode;

/// Returns 200 while the server is up. No dependencies are checked; a
/// degraded shared store must not make the probe restart the process.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
