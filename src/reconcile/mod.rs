//! Reconciliation: read-only comparison of source-of-truth orders against
//! recorded deliveries.
//!
//! The engine mutates nothing and works on plain slices, so it can run
//! concurrently per shop. Orders come from an external snapshot; deliveries
//! come from the ledger's attempts log. The latest "ok" attempt per
//! (order, platform) is authoritative.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::{AttemptStatus, DeliveryAttempt};
use crate::types::{Platform, ShopId};

/// Default delivery-delay threshold before an order is flagged as late.
pub const DEFAULT_DELAY_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Half-open time window `[from, to)`; an unbounded end admits everything.
///
/// Both orders and attempts are scoped to the window, so a delivery recorded
/// outside it does not count toward the window's match figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at < to)
    }
}

/// One source-of-truth order, external to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: u64,
    pub value: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-platform reconciliation figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformReport {
    pub platform: Platform,
    pub orders: usize,
    pub matched: usize,
    pub match_rate: f64,
    pub discrepancies: usize,
    pub discrepancy_rate: f64,
    /// Sum of |order value − delivered value| over matched orders.
    pub value_discrepancy: f64,
    /// Value discrepancy relative to total order value.
    pub value_discrepancy_rate: f64,
    /// Orders with more than one "ok" attempt; usually a dedup-policy bug.
    pub duplicate_orders: Vec<u64>,
    /// Orders whose first "ok" attempt landed later than the threshold.
    pub delayed_orders: Vec<u64>,
}

/// The full report for one shop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub shop: ShopId,
    pub window: TimeWindow,
    pub platforms: Vec<PlatformReport>,
    /// Orders missing from every configured platform, reported once.
    pub systemic_gaps: Vec<u64>,
    pub generated_at: DateTime<Utc>,
}

/// Runs reconciliation over one shop's orders and attempts, scoped to a
/// time window.
pub fn reconcile(
    shop: &ShopId,
    orders: &[OrderSnapshot],
    attempts: &[DeliveryAttempt],
    platforms: &[Platform],
    window: TimeWindow,
    delay_threshold: Duration,
) -> ReconciliationReport {
    let orders: Vec<&OrderSnapshot> = orders
        .iter()
        .filter(|o| window.contains(o.created_at))
        .collect();

    // (platform, order key) → ok attempts, in log order.
    let mut ok_attempts: HashMap<(Platform, &str), Vec<&DeliveryAttempt>> = HashMap::new();
    for attempt in attempts {
        if attempt.status == AttemptStatus::Ok && window.contains(attempt.created_at) {
            ok_attempts
                .entry((attempt.platform, attempt.order_key.as_str()))
                .or_default()
                .push(attempt);
        }
    }

    let total_value: f64 = orders.iter().map(|o| o.value).sum();
    let mut platform_reports = Vec::with_capacity(platforms.len());
    let mut matched_anywhere: HashMap<u64, bool> = HashMap::new();

    for &platform in platforms {
        let mut matched = 0usize;
        let mut value_discrepancy = 0.0f64;
        let mut duplicate_orders = Vec::new();
        let mut delayed_orders = Vec::new();

        for order in &orders {
            let key = order.order_id.to_string();
            let Some(hits) = ok_attempts.get(&(platform, key.as_str())) else {
                matched_anywhere.entry(order.order_id).or_insert(false);
                continue;
            };

            matched += 1;
            matched_anywhere.insert(order.order_id, true);

            if hits.len() > 1 {
                duplicate_orders.push(order.order_id);
            }

            // Latest ok is authoritative for the delivered value.
            if let Some(latest) = hits.last()
                && let Some(delivered) = latest.value
            {
                value_discrepancy += (order.value - delivered).abs();
            }

            if let Some(first) = hits.first() {
                let delay = (first.created_at - order.created_at).num_seconds();
                if delay > delay_threshold.as_secs() as i64 {
                    delayed_orders.push(order.order_id);
                }
            }
        }

        let orders_total = orders.len();
        let discrepancies = orders_total - matched;
        platform_reports.push(PlatformReport {
            platform,
            orders: orders_total,
            matched,
            match_rate: rate(matched, orders_total),
            discrepancies,
            discrepancy_rate: rate(discrepancies, orders_total),
            value_discrepancy,
            value_discrepancy_rate: if total_value > 0.0 {
                value_discrepancy / total_value
            } else {
                0.0
            },
            duplicate_orders,
            delayed_orders,
        });
    }

    // An order absent from every platform is one systemic gap, not a
    // per-platform entry.
    let mut systemic_gaps: Vec<u64> = if platforms.is_empty() {
        Vec::new()
    } else {
        orders
            .iter()
            .map(|o| o.order_id)
            .filter(|id| !matched_anywhere.get(id).copied().unwrap_or(false))
            .collect()
    };
    systemic_gaps.sort_unstable();
    systemic_gaps.dedup();

    info!(
        shop = %shop,
        orders = orders.len(),
        platforms = platforms.len(),
        systemic_gaps = systemic_gaps.len(),
        "reconciliation complete"
    );

    ReconciliationReport {
        shop: shop.clone(),
        window,
        platforms: platform_reports,
        systemic_gaps,
        generated_at: Utc::now(),
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Loads the external order snapshot for a shop from
/// `<data_dir>/orders/<shop>.json`. A missing file means no orders.
pub fn load_orders(data_dir: &Path, shop: &ShopId) -> std::io::Result<Vec<OrderSnapshot>> {
    let path = data_dir.join("orders").join(format!("{shop}.json"));
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}
