//! The ingestion pipeline: auth → resolve → normalize → dedup → consent →
//! dispatch → ledger.
//!
//! Requests are processed with a partial-success model: request-level checks
//! (shape, shop, signature, origin, rate limit) reject the whole request,
//! while everything per-event degrades into a per-event outcome. Once any
//! part of a batch was durably recorded the request as a whole succeeds, and
//! resubmission is safe because dedup collapses the replays.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::normalize::{self, InboundEvent, ParseError, ValidationError};
use crate::auth::{
    self, NonceVerdict, OriginVerdict, SignatureVerdict, TrustLevel, verify_with_rotation,
};
use crate::consent::{self, SkippedPlatform};
use crate::dedup::{self, KeyError};
use crate::dispatch::Dispatcher;
use crate::ledger::{AttemptStatus, EventReceipt, Ledger, LedgerError, RecordOutcome};
use crate::shop::{PlatformSettings, ShopError, ShopRecord, ShopResolver};
use crate::store::{StoreError, StoreHandle};
use crate::types::{EventId, EventOrigin, Platform};

/// Request-level rejections. Nothing was recorded when one of these is
/// returned (the rate-limit counter aside).
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("unknown shop")]
    UnknownShop,
    #[error("inactive shop")]
    InactiveShop,
    #[error("{0}")]
    Malformed(String),
    #[error("no shop domain in header or payload")]
    MissingShopDomain,
    #[error("signature rejected")]
    SignatureRejected,
    #[error("origin rejected: {0}")]
    OriginRejected(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("shared store unavailable")]
    StoreUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for Rejection {
    fn from(_: StoreError) -> Self {
        Rejection::StoreUnavailable
    }
}

impl From<LedgerError> for Rejection {
    fn from(err: LedgerError) -> Self {
        Rejection::Internal(err.to_string())
    }
}

/// Per-event processing outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    /// Recorded and dispatched.
    Processed {
        event_id: EventId,
        delivered: Vec<Platform>,
        failed: Vec<Platform>,
        skipped: Vec<SkippedPlatform>,
    },
    /// Already recorded; a no-op success.
    Duplicate { event_id: EventId },
    /// Timestamp outside the replay window; silently dropped.
    Stale,
    /// The nonce was already consumed.
    NonceReplayed,
    /// Untrusted under the shop's strict policy.
    AuthRejected,
    /// Failed per-event validation.
    Invalid { reason: String },
}

/// One parsed HTTP ingestion request.
pub struct IngestRequest {
    pub body: Vec<u8>,
    pub shop_domain: Option<String>,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub signature: Option<String>,
}

/// The ingestion pipeline and its collaborators.
pub struct Pipeline {
    resolver: Arc<ShopResolver>,
    store: StoreHandle,
    ledger: Ledger,
    dispatcher: Arc<Dispatcher>,
    replay_window: Duration,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<ShopResolver>,
        store: StoreHandle,
        ledger: Ledger,
        dispatcher: Arc<Dispatcher>,
        replay_window: Duration,
    ) -> Self {
        Self {
            resolver,
            store,
            ledger,
            dispatcher,
            replay_window,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn resolver(&self) -> &ShopResolver {
        &self.resolver
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Processes one ingestion request end to end.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Vec<EventOutcome>, Rejection> {
        let inbound = normalize::parse_payload(&request.body).map_err(|err| match err {
            ParseError::Json(err) => Rejection::Malformed(format!("malformed JSON: {err}")),
            other => Rejection::Malformed(other.to_string()),
        })?;

        let domain = request
            .shop_domain
            .as_deref()
            .or_else(|| inbound.first().and_then(|e| e.shop_domain.as_deref()))
            .ok_or(Rejection::MissingShopDomain)?
            .to_string();

        let shop = match self.resolver.resolve(&domain).await {
            Ok(shop) => shop,
            Err(ShopError::Unknown(_)) => return Err(Rejection::UnknownShop),
            Err(ShopError::Inactive(_)) => return Err(Rejection::InactiveShop),
            Err(err @ ShopError::Unreadable { .. }) => {
                return Err(Rejection::Internal(err.to_string()));
            }
        };

        self.check_rate_limit(&shop).await?;

        let signature =
            verify_with_rotation(&request.body, request.signature.as_deref(), &shop.secrets);
        if signature == SignatureVerdict::Previous {
            info!(shop = %shop.id, "request verified with previous secret");
        }

        let origin_verdict = auth::check_origin(
            request.origin.as_deref(),
            request.referer.as_deref(),
            &shop,
        );
        if let OriginVerdict::Mismatch(host) = &origin_verdict
            && !auth::origin_permits(&origin_verdict, signature, shop.strict_auth)
        {
            warn!(shop = %shop.id, host, "origin rejected");
            return Err(Rejection::OriginRejected(host.clone()));
        }

        // A bad signature poisons the whole body; under the strict policy
        // nothing in it may proceed.
        if signature == SignatureVerdict::Invalid && shop.strict_auth {
            warn!(shop = %shop.id, "invalid signature rejected");
            return Err(Rejection::SignatureRejected);
        }

        // Server-to-server copies are signed and carry no browser origin.
        let event_origin = if signature.is_verified() && origin_verdict == OriginVerdict::Absent {
            EventOrigin::Server
        } else {
            EventOrigin::Client
        };

        let mut outcomes = Vec::with_capacity(inbound.len());
        for raw in inbound {
            outcomes.push(
                self.process_event(raw, &shop, signature, event_origin)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    async fn process_event(
        &self,
        raw: InboundEvent,
        shop: &ShopRecord,
        signature: SignatureVerdict,
        event_origin: EventOrigin,
    ) -> Result<EventOutcome, Rejection> {
        let event = match normalize::normalize(raw, &shop.id, event_origin) {
            Ok(event) => event,
            Err(err @ (ValidationError::UnknownEventType(_)
            | ValidationError::MissingTimestamp
            | ValidationError::TooManyItems { .. })) => {
                return Ok(EventOutcome::Invalid {
                    reason: err.to_string(),
                });
            }
        };

        let trust = auth::classify_trust(
            signature,
            shop.signature_optional,
            event.event_type.is_purchase(),
        );
        if trust == TrustLevel::Untrusted {
            if shop.strict_auth {
                return Ok(EventOutcome::AuthRejected);
            }
            warn!(shop = %shop.id, event_type = %event.event_type, "untrusted event passed through");
        }

        // Outside the window: drop silently, no side effects.
        if !auth::within_window(event.timestamp, Utc::now(), self.replay_window) {
            return Ok(EventOutcome::Stale);
        }

        let keys = match dedup::derive_match_keys(&event) {
            Ok(keys) => keys,
            Err(err @ (KeyError::PurchaseWithoutOrder | KeyError::NoIdentity)) => {
                return Ok(EventOutcome::Invalid {
                    reason: err.to_string(),
                });
            }
        };
        let event_id = dedup::canonical_event_id(&event, &keys);

        if let Some(nonce) = &event.nonce {
            let verdict = auth::consume_nonce(
                self.store.as_ref(),
                &shop.id,
                &keys.order_key,
                nonce,
                self.replay_window,
            )
            .await?;
            if verdict == NonceVerdict::Replayed {
                warn!(shop = %shop.id, event_id = event_id.short(), "nonce replayed");
                return Ok(EventOutcome::NonceReplayed);
            }
        }

        // Dedup pre-check. Concurrent requests can both pass this; the
        // receipt write below is the arbiter.
        if let Some(existing) = self.find_existing(shop, &event_id, &keys, &event)? {
            return Ok(EventOutcome::Duplicate { event_id: existing });
        }

        let platforms = ordered_platforms(shop);
        let decision = consent::filter_platforms(&event.consent, &platforms);
        let (configured, included, skipped) = decision.metrics();
        info!(
            shop = %shop.id,
            event_id = event_id.short(),
            event_type = %event.event_type,
            configured,
            included,
            skipped,
            "consent decision"
        );

        let receipt = EventReceipt {
            shop: shop.id.clone(),
            event_id: event_id.clone(),
            event_type: event.event_type,
            order_key: keys.order_key.clone(),
            alt_order_key: keys.alt_order_key.clone(),
            origin: event.origin,
            platforms: decision.included.clone(),
            value: event.value,
            currency: event.currency.clone(),
            created_at: Utc::now(),
        };
        if self.ledger.record_receipt(&receipt)? == RecordOutcome::AlreadyRecorded {
            return Ok(EventOutcome::Duplicate { event_id });
        }

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for platform in &decision.included {
            let settings = &shop.platforms[platform];
            let attempt = self
                .dispatcher
                .send(*platform, &event, &event_id, &keys.order_key, settings)
                .await;
            // One attempt row per invocation, whatever the outcome.
            self.ledger.append_attempt(&shop.id, &attempt)?;
            match attempt.status {
                AttemptStatus::Ok => delivered.push(*platform),
                _ => failed.push(*platform),
            }
        }

        Ok(EventOutcome::Processed {
            event_id,
            delivered,
            failed,
            skipped: decision.skipped,
        })
    }

    fn find_existing(
        &self,
        shop: &ShopRecord,
        event_id: &EventId,
        keys: &dedup::MatchKeys,
        event: &crate::types::NormalizedEvent,
    ) -> Result<Option<EventId>, Rejection> {
        if event.event_type.is_purchase() {
            if let Some(existing) = self.ledger.find_purchase_receipt(
                &shop.id,
                &keys.order_key,
                event.event_type,
            )? {
                return Ok(Some(existing));
            }
            if let Some(alt) = &keys.alt_order_key
                && let Some(existing) =
                    self.ledger
                        .find_purchase_receipt(&shop.id, alt, event.event_type)?
            {
                return Ok(Some(existing));
            }
            return Ok(None);
        }

        if self.ledger.has_receipt(&shop.id, event_id)? {
            return Ok(Some(event_id.clone()));
        }
        Ok(None)
    }

    async fn check_rate_limit(&self, shop: &ShopRecord) -> Result<(), Rejection> {
        let minute = Utc::now().timestamp() / 60;
        let key = format!("rate:{}:{minute}", shop.id);
        let count = self
            .store
            .incr_with_ttl(&key, Duration::from_secs(60))
            .await?;
        if count > u64::from(shop.rate_limit_per_minute) {
            warn!(shop = %shop.id, count, "rate limited");
            return Err(Rejection::RateLimited);
        }
        Ok(())
    }
}

fn ordered_platforms(shop: &ShopRecord) -> Vec<(Platform, PlatformSettings)> {
    shop.configured_platforms()
        .into_iter()
        .map(|p| (p, shop.platforms[&p].clone()))
        .collect()
}
