//! Dispatch router and per-platform adapters.
//!
//! Every destination implements one contract: shape the normalized event
//! into the platform's wire format, post it, and classify the outcome. The
//! router dispatches by an exhaustive match on the platform tag; there is no
//! runtime shape-sniffing.
//!
//! Exactly one [`DeliveryAttempt`] is produced per adapter invocation,
//! whatever happens: transport errors, non-2xx responses, and
//! platform-reported error bodies all become a failed attempt with an error
//! string, never a silent drop.

pub mod google;
pub mod meta;
pub mod pinterest;
pub mod tiktok;

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{AttemptStatus, DeliveryAttempt};
use crate::shop::PlatformSettings;
use crate::types::{EventId, NormalizedEvent, OrderKey, Platform, Region};

/// Default per-call timeout for platform requests.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error-body excerpt kept in an attempt record.
const ERROR_BODY_LIMIT: usize = 512;

/// Errors shaping a request before it is sent.
#[derive(Debug, Error, PartialEq)]
pub enum PrepareError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

/// A shaped request ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub endpoint: String,
    /// Extra headers beyond content type (e.g., bearer tokens).
    pub headers: Vec<(&'static str, String)>,
    pub body: serde_json::Value,
}

/// Everything an adapter needs to shape one request.
pub struct AdapterInput<'a> {
    pub event: &'a NormalizedEvent,
    /// Platform-scoped stable event id, sent for platform-side dedup.
    pub wire_event_id: &'a str,
    pub order_key: &'a OrderKey,
    pub settings: &'a PlatformSettings,
    /// Endpoint base URL (overridable in tests).
    pub base: &'a str,
}

/// Base URLs per destination.
#[derive(Debug, Clone)]
pub struct EndpointBases {
    pub meta: String,
    pub google: String,
    pub google_eu: String,
    pub tiktok: String,
    pub pinterest: String,
}

impl Default for EndpointBases {
    fn default() -> Self {
        Self {
            meta: "https://graph.facebook.com/v18.0".into(),
            google: "https://www.google-analytics.com".into(),
            google_eu: "https://region1.google-analytics.com".into(),
            tiktok: "https://business-api.tiktok.com".into(),
            pinterest: "https://api.pinterest.com".into(),
        }
    }
}

/// The dispatch router.
pub struct Dispatcher {
    http: reqwest::Client,
    bases: EndpointBases,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_bases(timeout, EndpointBases::default())
    }

    pub fn with_bases(timeout: Duration, bases: EndpointBases) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, bases })
    }

    /// Sends one event to one destination and records the outcome.
    ///
    /// Never fails the calling request: every outcome, including a request
    /// that could not even be shaped, becomes a delivery attempt.
    pub async fn send(
        &self,
        platform: Platform,
        event: &NormalizedEvent,
        event_id: &EventId,
        order_key: &OrderKey,
        settings: &PlatformSettings,
    ) -> DeliveryAttempt {
        let wire_event_id = crate::dedup::platform_event_id(event_id, platform);
        let input = AdapterInput {
            event,
            wire_event_id: &wire_event_id,
            order_key,
            settings,
            base: self.base_for(platform, settings.region),
        };

        let prepared = match platform {
            Platform::Meta => meta::prepare(&input),
            Platform::Google => google::prepare(&input),
            Platform::Tiktok => tiktok::prepare(&input),
            Platform::Pinterest => pinterest::prepare(&input),
        };

        let (request, status, status_code, error) = match prepared {
            Ok(request) => {
                let (status, status_code, error) =
                    self.execute(platform, &request).await;
                (request.body, status, status_code, error)
            }
            Err(err) => {
                warn!(
                    platform = platform.as_str(),
                    event_id = event_id.short(),
                    error = %err,
                    "could not shape platform request"
                );
                (
                    serde_json::Value::Null,
                    AttemptStatus::Fail,
                    None,
                    Some(err.to_string()),
                )
            }
        };

        DeliveryAttempt {
            event_id: event_id.clone(),
            order_key: order_key.clone(),
            platform,
            status,
            status_code,
            error,
            value: Some(event.total_value()),
            currency: event.currency.clone(),
            request,
            created_at: Utc::now(),
        }
    }

    async fn execute(
        &self,
        platform: Platform,
        request: &PreparedRequest,
    ) -> (AttemptStatus, Option<u16>, Option<String>) {
        let mut builder = self.http.post(&request.endpoint).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                // Timeouts and connection failures are recorded, not dropped.
                return (AttemptStatus::Fail, None, Some(format!("transport: {err}")));
            }
        };

        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status_code) {
            return (
                AttemptStatus::Fail,
                Some(status_code),
                Some(format!("upstream {status_code}: {}", excerpt(&body))),
            );
        }

        // Some platforms report failure inside a 2xx body.
        if let Some(error) = body_error(platform, &body) {
            return (AttemptStatus::Fail, Some(status_code), Some(error));
        }

        debug!(platform = platform.as_str(), status_code, "delivered");
        (AttemptStatus::Ok, Some(status_code), None)
    }

    fn base_for(&self, platform: Platform, region: Region) -> &str {
        match (platform, region) {
            (Platform::Meta, _) => &self.bases.meta,
            (Platform::Google, Region::Eu) => &self.bases.google_eu,
            (Platform::Google, Region::Global) => &self.bases.google,
            (Platform::Tiktok, _) => &self.bases.tiktok,
            (Platform::Pinterest, _) => &self.bases.pinterest,
        }
    }
}

/// Detects a platform-reported error inside a 2xx response body.
fn body_error(platform: Platform, body: &str) -> Option<String> {
    match platform {
        // TikTok answers 200 with {"code": N, "message": ...}; 0 is success.
        Platform::Tiktok => {
            let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
            let code = parsed.get("code")?.as_i64()?;
            if code == 0 {
                return None;
            }
            let message = parsed
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            Some(format!("platform error {code}: {message}"))
        }
        Platform::Meta | Platform::Google | Platform::Pinterest => None,
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}

/// Pulls a required credential field, by name for error reporting.
pub(crate) fn require<'a>(
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, PrepareError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or(PrepareError::MissingCredential(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use chrono::Utc;

    use crate::shop::{EnvironmentConfig, PlatformCredentials};
    use crate::types::{ConsentFlags, EventOrigin, EventType, ShopId};

    fn purchase_event() -> NormalizedEvent {
        NormalizedEvent {
            shop: ShopId::new("shop"),
            event_type: EventType::Purchase,
            timestamp: Utc::now(),
            origin: EventOrigin::Client,
            consent: ConsentFlags::default(),
            order_id: Some(1001),
            checkout_token: None,
            session_id: None,
            value: Some(42.5),
            currency: Some("USD".into()),
            items: Vec::new(),
            nonce: None,
        }
    }

    fn meta_settings() -> PlatformSettings {
        PlatformSettings {
            server_side_enabled: true,
            environment: EnvironmentConfig {
                credentials: PlatformCredentials {
                    pixel_id: Some("px-1".into()),
                    access_token: Some("tok".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn dispatcher_at(base: String) -> Dispatcher {
        let bases = EndpointBases {
            meta: base.clone(),
            google: base.clone(),
            google_eu: base.clone(),
            tiktok: base.clone(),
            pinterest: base,
        };
        Dispatcher::with_bases(Duration::from_secs(2), bases).unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_is_an_ok_attempt() {
        let base = serve(Router::new().route(
            "/v18.0/{pixel}/events",
            post(|| async { "{\"events_received\":1}" }),
        ))
        .await;
        // Meta paths start at the version segment, which the test base lacks.
        let dispatcher = dispatcher_at(format!("{base}/v18.0"));

        let event = purchase_event();
        let attempt = dispatcher
            .send(
                Platform::Meta,
                &event,
                &EventId::new("e1"),
                &OrderKey::new("1001"),
                &meta_settings(),
            )
            .await;

        assert_eq!(attempt.status, AttemptStatus::Ok);
        assert_eq!(attempt.status_code, Some(200));
        assert_eq!(attempt.error, None);
        assert_eq!(attempt.platform, Platform::Meta);
    }

    #[tokio::test]
    async fn upstream_500_is_a_failed_attempt_with_body_excerpt() {
        let base = serve(Router::new().route(
            "/v18.0/{pixel}/events",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "pixel exploded") }),
        ))
        .await;
        let dispatcher = dispatcher_at(format!("{base}/v18.0"));

        let event = purchase_event();
        let attempt = dispatcher
            .send(
                Platform::Meta,
                &event,
                &EventId::new("e1"),
                &OrderKey::new("1001"),
                &meta_settings(),
            )
            .await;

        assert_eq!(attempt.status, AttemptStatus::Fail);
        assert_eq!(attempt.status_code, Some(500));
        assert!(attempt.error.as_deref().unwrap().contains("pixel exploded"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_failed_attempt() {
        // Nothing listens here.
        let dispatcher = dispatcher_at("http://127.0.0.1:1".into());

        let event = purchase_event();
        let attempt = dispatcher
            .send(
                Platform::Meta,
                &event,
                &EventId::new("e1"),
                &OrderKey::new("1001"),
                &meta_settings(),
            )
            .await;

        assert_eq!(attempt.status, AttemptStatus::Fail);
        assert_eq!(attempt.status_code, None);
        assert!(attempt.error.as_deref().unwrap().starts_with("transport:"));
    }

    #[tokio::test]
    async fn tiktok_error_body_inside_200_is_a_failure() {
        let base = serve(Router::new().route(
            "/open_api/v1.3/event/track/",
            post(|| async { r#"{"code":40001,"message":"invalid pixel"}"# }),
        ))
        .await;
        let dispatcher = dispatcher_at(base);

        let mut settings = meta_settings();
        settings.environment.credentials.pixel_id = Some("tt-px".into());

        let event = purchase_event();
        let attempt = dispatcher
            .send(
                Platform::Tiktok,
                &event,
                &EventId::new("e1"),
                &OrderKey::new("1001"),
                &settings,
            )
            .await;

        assert_eq!(attempt.status, AttemptStatus::Fail);
        assert_eq!(attempt.status_code, Some(200));
        assert!(
            attempt
                .error
                .as_deref()
                .unwrap()
                .contains("platform error 40001")
        );
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_a_network_call() {
        let dispatcher = dispatcher_at("http://127.0.0.1:1".into());

        let settings = PlatformSettings {
            server_side_enabled: true,
            ..Default::default()
        };
        let event = purchase_event();
        let attempt = dispatcher
            .send(
                Platform::Meta,
                &event,
                &EventId::new("e1"),
                &OrderKey::new("1001"),
                &settings,
            )
            .await;

        assert_eq!(attempt.status, AttemptStatus::Fail);
        assert_eq!(
            attempt.error.as_deref(),
            Some("missing credential: pixel_id")
        );
    }

    #[test]
    fn eu_region_selects_the_eu_google_base() {
        let bases = EndpointBases {
            google: "https://global.example".into(),
            google_eu: "https://eu.example".into(),
            ..Default::default()
        };
        let dispatcher = Dispatcher::with_bases(Duration::from_secs(1), bases).unwrap();

        assert_eq!(
            dispatcher.base_for(Platform::Google, Region::Eu),
            "https://eu.example"
        );
        assert_eq!(
            dispatcher.base_for(Platform::Google, Region::Global),
            "https://global.example"
        );
        // Region does not change single-endpoint platforms.
        assert_eq!(
            dispatcher.base_for(Platform::Meta, Region::Eu),
            dispatcher.base_for(Platform::Meta, Region::Global)
        );
    }

    #[test]
    fn body_error_only_applies_to_tiktok() {
        let body = r#"{"code":1,"message":"bad"}"#;
        assert!(body_error(Platform::Tiktok, body).is_some());
        assert!(body_error(Platform::Meta, body).is_none());
        assert!(body_error(Platform::Tiktok, r#"{"code":0}"#).is_none());
        assert!(body_error(Platform::Tiktok, "not json").is_none());
    }
}
