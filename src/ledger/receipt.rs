//! Event receipts: the dedup ground truth.
//!
//! A receipt is written once per logical event, purchase receipts even when
//! consent filtered out every destination, so reconciliation can always see
//! that the event existed. The write is guarded by an exclusive-create
//! constraint; a constraint violation is the normal "concurrent duplicate"
//! outcome, never a fault.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::fsync::{fsync_dir, fsync_file};
use super::{Ledger, Result};
use crate::types::{EventId, EventOrigin, EventType, OrderKey, Platform, ShopId};

/// A persisted event receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceipt {
    pub shop: ShopId,
    pub event_id: EventId,
    pub event_type: EventType,
    pub order_key: OrderKey,
    #[serde(default)]
    pub alt_order_key: Option<OrderKey>,
    pub origin: EventOrigin,
    /// Platforms consent permitted for this event (may be empty).
    #[serde(default)]
    pub platforms: Vec<Platform>,
    /// Monetary value, kept so recovery dispatch can rebuild the payload.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a receipt write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This writer created the receipt.
    Recorded,
    /// A receipt for the same identity already exists; the event is a no-op.
    AlreadyRecorded,
}

impl Ledger {
    /// Records a receipt, enforcing the uniqueness constraint.
    ///
    /// Purchases are additionally guarded per (order key, event type): two
    /// copies of the same order collapse even when their event ids differ
    /// (e.g., only one copy carried a nonce).
    ///
    /// The receipt is written before the guard. A crash between the two
    /// leaves an extra receipt that recovery dispatch can act on, never a
    /// guard pointing at an event that was never persisted. A retry of the
    /// same event recreates a guard lost to such a crash.
    pub fn record_receipt(&self, receipt: &EventReceipt) -> Result<RecordOutcome> {
        let shop_dir = self.shop_dir(&receipt.shop);
        let receipts_dir = shop_dir.join("receipts");
        fs::create_dir_all(&receipts_dir)?;

        let receipt_path = receipts_dir.join(format!("{}.json", receipt.event_id));
        let created = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&receipt_path)
        {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(receipt)?)?;
                fsync_file(&file)?;
                fsync_dir(&receipts_dir)?;
                true
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => false,
            Err(err) => return Err(err.into()),
        };

        if !receipt.event_type.is_purchase() {
            return Ok(if created {
                RecordOutcome::Recorded
            } else {
                RecordOutcome::AlreadyRecorded
            });
        }

        let guards_dir = shop_dir.join("guards");
        fs::create_dir_all(&guards_dir)?;
        let guard_path = guards_dir.join(guard_name(&receipt.order_key, receipt.event_type));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard_path)
        {
            Ok(mut guard) => {
                guard.write_all(receipt.event_id.as_str().as_bytes())?;
                fsync_file(&guard)?;
                fsync_dir(&guards_dir)?;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if created {
                    // Another event id won this order while we were writing.
                    // The losing receipt must not linger, or recovery
                    // dispatch would replay it.
                    let _ = fs::remove_file(&receipt_path);
                    return Ok(RecordOutcome::AlreadyRecorded);
                }
            }
            Err(err) => return Err(err.into()),
        }

        Ok(if created {
            RecordOutcome::Recorded
        } else {
            RecordOutcome::AlreadyRecorded
        })
    }

    /// Looks up the winning event id for a purchase identity, if recorded.
    pub fn find_purchase_receipt(
        &self,
        shop: &ShopId,
        order_key: &OrderKey,
        event_type: EventType,
    ) -> Result<Option<EventId>> {
        let guard_path = self
            .shop_dir(shop)
            .join("guards")
            .join(guard_name(order_key, event_type));
        match fs::read_to_string(&guard_path) {
            Ok(id) => Ok(Some(EventId::new(id))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a receipt exists for this event id.
    pub fn has_receipt(&self, shop: &ShopId, event_id: &EventId) -> Result<bool> {
        let path = self
            .shop_dir(shop)
            .join("receipts")
            .join(format!("{event_id}.json"));
        Ok(path.exists())
    }

    /// Loads one receipt, if present.
    pub fn load_receipt(&self, shop: &ShopId, event_id: &EventId) -> Result<Option<EventReceipt>> {
        let path = self
            .shop_dir(shop)
            .join("receipts")
            .join(format!("{event_id}.json"));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Loads every receipt for a shop. Used by reconciliation.
    pub fn read_receipts(&self, shop: &ShopId) -> Result<Vec<EventReceipt>> {
        let receipts_dir = self.shop_dir(shop).join("receipts");
        let entries = match fs::read_dir(&receipts_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut receipts = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = fs::read(entry.path())?;
            receipts.push(serde_json::from_slice(&bytes)?);
        }
        Ok(receipts)
    }
}

/// File name for a purchase uniqueness guard.
///
/// Order keys can contain characters that are not filesystem-safe (session
/// keys embed client-supplied ids), so the name is a hash of the identity.
fn guard_name(order_key: &OrderKey, event_type: EventType) -> String {
    let digest = Sha256::digest(format!("{order_key}\n{event_type}").as_bytes());
    format!("{}.guard", hex::encode(&digest[..16]))
}
