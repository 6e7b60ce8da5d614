//! HTTP server for the conversion relay.
//!
//! # Endpoints
//!
//! - `POST /api/v1/ingest` — accepts conversion events (single or batch);
//!   `?mode=async` spools the request and returns 202
//! - `GET`/`POST /api/v1/tasks/{task}` — runs a maintenance task under the
//!   distributed lock (admin secret required; optional one-shot `nonce`)
//! - `GET /api/v1/shops/{shop}/reconciliation` — reconciliation report for
//!   one shop (admin secret required)
//! - `POST /api/v1/shops/{shop}/platforms/{platform}/environment` — switch
//!   or roll back a destination's test/live environment (admin secret
//!   required)
//! - `GET /health` — liveness probe

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

pub mod health;
pub mod ingest;
pub mod report;
pub mod shops;
pub mod tasks;

pub use health::health_handler;
pub use ingest::{HEADER_SHOP_DOMAIN, HEADER_SIGNATURE, ingest_handler};
pub use report::reconciliation_handler;
pub use shops::environment_handler;
pub use tasks::task_handler;

use crate::ingest::{MAX_BODY_BYTES, Pipeline};
use crate::worker::{IngestQueue, TaskRunner};

/// The admin bearer secret, with a previous one honored during rotation.
#[derive(Clone)]
pub struct AdminSecrets {
    pub current: String,
    pub previous: Option<String>,
}

impl AdminSecrets {
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            previous: None,
        }
    }

    fn matches(&self, provided: &str) -> bool {
        digest_eq(provided, &self.current)
            || self
                .previous
                .as_deref()
                .is_some_and(|prev| digest_eq(provided, prev))
    }
}

/// Compares secrets through their digests, so comparison time does not leak
/// how much of the secret matched.
fn digest_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

/// Checks the `Authorization: Bearer` header against the admin secrets.
pub(crate) fn authorized(headers: &HeaderMap, secrets: &AdminSecrets) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| secrets.matches(token))
}

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pipeline: Arc<Pipeline>,
    runner: TaskRunner,
    data_dir: PathBuf,
    admin_secrets: AdminSecrets,
}

impl AppState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        runner: TaskRunner,
        data_dir: impl Into<PathBuf>,
        admin_secrets: AdminSecrets,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                pipeline,
                runner,
                data_dir: data_dir.into(),
                admin_secrets,
            }),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    pub fn queue(&self) -> &IngestQueue {
        self.inner.runner.queue()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn admin_secrets(&self) -> &AdminSecrets {
        &self.inner.admin_secrets
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/v1/ingest", post(ingest_handler))
        .route("/api/v1/tasks/{task}", get(task_handler).post(task_handler))
        .route(
            "/api/v1/shops/{shop}/reconciliation",
            get(reconciliation_handler),
        )
        .route(
            "/api/v1/shops/{shop}/platforms/{platform}/environment",
            post(environment_handler),
        )
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::auth::{compute_signature, format_signature_header};
    use crate::dispatch::{Dispatcher, EndpointBases};
    use crate::ledger::Ledger;
    use crate::lock::DistributedLock;
    use crate::shop::ShopResolver;
    use crate::shop::test_fixtures::{shop_record, write_record};
    use crate::store::{MemoryStore, StoreHandle};
    use crate::types::{HolderToken, LockType, ShopId};

    const DOMAIN: &str = "example.myshopify.com";
    const ADMIN_SECRET: &str = "admin-secret";

    struct Harness {
        app: Router,
        lock: DistributedLock,
        ledger: Ledger,
        data_dir: TempDir,
    }

    async fn serve_ok() -> String {
        let router = Router::new()
            .route("/{pixel}/events", post(|| async { "{}" }))
            .route("/mp/collect", post(|| async { "" }))
            .route("/open_api/v1.3/event/track/", post(|| async { r#"{"code":0}"# }))
            .route("/v5/ad_accounts/{acct}/events", post(|| async { "{}" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn harness_with(record: crate::shop::ShopRecord) -> Harness {
        let data_dir = TempDir::new().unwrap();
        write_record(data_dir.path(), &record);

        let base = serve_ok().await;
        let bases = EndpointBases {
            meta: base.clone(),
            google: base.clone(),
            google_eu: base.clone(),
            tiktok: base.clone(),
            pinterest: base,
        };

        let store: StoreHandle = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(data_dir.path());
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(ShopResolver::new(data_dir.path())),
            store.clone(),
            ledger.clone(),
            Arc::new(Dispatcher::with_bases(Duration::from_secs(2), bases).unwrap()),
            Duration::from_secs(600),
        ));
        let lock = DistributedLock::new(store);
        let runner = TaskRunner::new(
            pipeline.clone(),
            lock.clone(),
            IngestQueue::new(data_dir.path()),
        );

        let state = AppState::new(
            pipeline,
            runner,
            data_dir.path(),
            AdminSecrets::new(ADMIN_SECRET),
        );
        Harness {
            app: build_router(state),
            lock,
            ledger,
            data_dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(shop_record(DOMAIN)).await
    }

    fn purchase_body(order_id: u64, nonce: &str) -> Vec<u8> {
        format!(
            r#"{{
                "eventName": "purchase",
                "timestamp": "{}",
                "consent": {{"marketing": true}},
                "data": {{"orderId": {order_id}, "value": 42.5, "currency": "USD"}},
                "nonce": "{nonce}"
            }}"#,
            Utc::now().to_rfc3339()
        )
        .into_bytes()
    }

    fn ingest_request(body: &[u8], secret: &str) -> Request<Body> {
        ingest_request_at("/api/v1/ingest", body, secret)
    }

    fn ingest_request_at(uri: &str, body: &[u8], secret: &str) -> Request<Body> {
        let signature =
            format_signature_header(&compute_signature(body, secret.as_bytes()));
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(HEADER_SHOP_DOMAIN, DOMAIN)
            .header(HEADER_SIGNATURE, signature)
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    fn task_request(task: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/tasks/{task}"));
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn environment_request(shop: &str, platform: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/shops/{shop}/platforms/{platform}/environment"))
            .header("authorization", format!("Bearer {ADMIN_SECRET}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_200() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn signed_purchase_returns_200_with_outcomes() {
        let h = harness().await;
        let body = purchase_body(1001, "n-1");

        let response = h
            .app
            .oneshot(ingest_request(&body, "current-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["results"][0]["status"], "processed");
        assert_eq!(json["results"][0]["delivered"][0], "meta");

        assert_eq!(h.ledger.read_receipts(&ShopId::new(DOMAIN)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_signature_returns_403() {
        let h = harness().await;
        let body = purchase_body(1001, "n-1");

        let response = h
            .app
            .oneshot(ingest_request(&body, "wrong-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_shop_returns_401() {
        let h = harness().await;
        let body = purchase_body(1001, "n-1");
        let signature =
            format_signature_header(&compute_signature(&body, b"current-secret"));
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/ingest")
            .header(HEADER_SHOP_DOMAIN, "nobody.example")
            .header(HEADER_SIGNATURE, signature)
            .body(Body::from(body))
            .unwrap();

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_body_returns_400() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(ingest_request(b"{not json", "current-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_returns_413() {
        let h = harness().await;
        let body = vec![b' '; MAX_BODY_BYTES + 1];
        let response = h
            .app
            .oneshot(ingest_request(&body, "current-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn rate_limit_returns_429() {
        let mut record = shop_record(DOMAIN);
        record.rate_limit_per_minute = 1;
        let h = harness_with(record).await;

        let first = h
            .app
            .clone()
            .oneshot(ingest_request(&purchase_body(1001, "n-1"), "current-secret"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = h
            .app
            .oneshot(ingest_request(&purchase_body(1002, "n-2"), "current-secret"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn single_stale_event_returns_204() {
        let h = harness().await;
        let body = format!(
            r#"{{
                "eventName": "purchase",
                "timestamp": "{}",
                "data": {{"orderId": 1001}}
            }}"#,
            (Utc::now() - chrono::TimeDelta::hours(2)).to_rfc3339()
        )
        .into_bytes();

        let response = h
            .app
            .oneshot(ingest_request(&body, "current-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn async_mode_spools_then_drain_processes() {
        let h = harness().await;
        let body = purchase_body(1001, "n-1");

        let response = h
            .app
            .clone()
            .oneshot(ingest_request_at(
                "/api/v1/ingest?mode=async",
                &body,
                "current-secret",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert_eq!(json["queued"], true);

        // Nothing recorded yet.
        assert!(h.ledger.read_receipts(&ShopId::new(DOMAIN)).unwrap().is_empty());

        let response = h
            .app
            .oneshot(task_request("drain_queue", Some(ADMIN_SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["result"]["drained"], 1);

        assert_eq!(h.ledger.read_receipts(&ShopId::new(DOMAIN)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tasks_require_the_admin_secret() {
        let h = harness().await;

        let missing = h
            .app
            .clone()
            .oneshot(task_request("drain_queue", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = h
            .app
            .oneshot(task_request("drain_queue", Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_task_returns_400() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(task_request("reindex", Some(ADMIN_SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn held_lock_returns_202_with_retry_hint() {
        let h = harness().await;
        let other = HolderToken::generate();
        h.lock
            .acquire(LockType::Cleanup, &other, Duration::from_secs(60))
            .await
            .unwrap();

        let response = h
            .app
            .oneshot(task_request("cleanup", Some(ADMIN_SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = json_body(response).await;
        assert_eq!(json["reason"], "lock_held");
        assert!(json["retryAfterMs"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn forced_task_runs_despite_held_lock() {
        let h = harness().await;
        let other = HolderToken::generate();
        h.lock
            .acquire(LockType::Cleanup, &other, Duration::from_secs(60))
            .await
            .unwrap();

        let response = h
            .app
            .oneshot({
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/tasks/cleanup?force=true")
                    .header("authorization", format!("Bearer {ADMIN_SECRET}"))
                    .body(Body::empty())
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reconciliation_reports_systemic_gaps() {
        let h = harness().await;

        let orders_dir = h.data_dir.path().join("orders");
        std::fs::create_dir_all(&orders_dir).unwrap();
        std::fs::write(
            orders_dir.join(format!("{DOMAIN}.json")),
            format!(
                r#"[{{"order_id": 1001, "value": 42.5, "created_at": "{}"}}]"#,
                Utc::now().to_rfc3339()
            ),
        )
        .unwrap();

        let response = h
            .app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/shops/{DOMAIN}/reconciliation"))
                    .header("authorization", format!("Bearer {ADMIN_SECRET}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["systemic_gaps"][0], 1001);
        assert_eq!(json["platforms"][0]["platform"], "meta");
    }

    #[tokio::test]
    async fn reconciliation_for_unknown_shop_returns_404() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/shops/nobody.example/reconciliation")
                    .header("authorization", format!("Bearer {ADMIN_SECRET}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn replayed_ingest_request_returns_403() {
        let h = harness().await;
        let body = purchase_body(1001, "n-1");

        let first = h
            .app
            .clone()
            .oneshot(ingest_request(&body, "current-secret"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // The byte-identical resubmission hits the replay guard.
        let second = h
            .app
            .oneshot(ingest_request(&body, "current-secret"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
        let json = json_body(second).await;
        assert_eq!(json["results"][0]["status"], "nonce_replayed");
    }

    #[tokio::test]
    async fn tasks_run_via_get() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/v1/tasks/cleanup")
                    .header("authorization", format!("Bearer {ADMIN_SECRET}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn task_nonce_cannot_be_reused() {
        let h = harness().await;
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/v1/tasks/cleanup?nonce=run-7")
                .header("authorization", format!("Bearer {ADMIN_SECRET}"))
                .body(Body::empty())
                .unwrap()
        };

        let first = h.app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = h.app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reconciliation_window_scopes_the_report() {
        let h = harness().await;

        let orders_dir = h.data_dir.path().join("orders");
        std::fs::create_dir_all(&orders_dir).unwrap();
        std::fs::write(
            orders_dir.join(format!("{DOMAIN}.json")),
            format!(
                r#"[{{"order_id": 1001, "value": 42.5, "created_at": "{}"}}]"#,
                Utc::now().to_rfc3339()
            ),
        )
        .unwrap();

        // A window starting in the future excludes the order entirely.
        let from = (Utc::now() + chrono::TimeDelta::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let response = h
            .app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/shops/{DOMAIN}/reconciliation?from={from}"))
                    .header("authorization", format!("Bearer {ADMIN_SECRET}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["platforms"][0]["orders"], 0);
        assert!(json["systemic_gaps"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn environment_switch_persists_and_rolls_back() {
        let h = harness().await;

        // The fixture's meta destination is fully credentialed.
        let response = h
            .app
            .clone()
            .oneshot(environment_request(
                DOMAIN,
                "meta",
                r#"{"action": "switch", "target": "live"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["environment"], "live");
        assert_eq!(json["version"], 1);

        // The switch was persisted: a later request can roll it back.
        let response = h
            .app
            .clone()
            .oneshot(environment_request(DOMAIN, "meta", r#"{"action": "rollback"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["environment"], "test");

        // The snapshot is consumed; nothing left to roll back.
        let response = h
            .app
            .oneshot(environment_request(DOMAIN, "meta", r#"{"action": "rollback"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn environment_promotion_without_credentials_is_refused() {
        let mut record = shop_record(DOMAIN);
        record
            .platforms
            .get_mut(&crate::types::Platform::Meta)
            .unwrap()
            .environment
            .credentials
            .access_token = None;
        let h = harness_with(record).await;

        let response = h
            .app
            .oneshot(environment_request(
                DOMAIN,
                "meta",
                r#"{"action": "switch", "target": "live"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = json_body(response).await;
        assert_eq!(json["missing"][0], "access_token");
    }

    #[tokio::test]
    async fn environment_switch_rejects_unknown_targets() {
        let h = harness().await;

        // Platform not configured for the shop.
        let response = h
            .app
            .clone()
            .oneshot(environment_request(
                DOMAIN,
                "google",
                r#"{"action": "switch", "target": "test"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Platform tag that does not exist at all.
        let response = h
            .app
            .oneshot(environment_request(
                DOMAIN,
                "snapchat",
                r#"{"action": "switch", "target": "test"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
