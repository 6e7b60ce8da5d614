//! The append-only delivery-attempts log.
//!
//! One JSON Lines file per shop, one object per adapter invocation. Complete
//! lines are always valid JSON; a partial line from a crash mid-write is
//! skipped on read (the log is append-only audit data, so a torn tail is
//! tolerated rather than truncated).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fsync::fsync_file;
use super::{Ledger, Result};
use crate::types::{EventId, OrderKey, Platform, ShopId};

/// Delivery status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Ok,
    Fail,
    Pending,
    Retrying,
}

/// One adapter invocation, recorded regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub event_id: EventId,
    pub order_key: OrderKey,
    pub platform: Platform,
    pub status: AttemptStatus,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    /// Value and currency as sent, for reconciliation's value comparison.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Snapshot of the request payload sent to the platform.
    pub request: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Ledger {
    /// Appends one attempt and syncs it to disk.
    pub fn append_attempt(&self, shop: &ShopId, attempt: &DeliveryAttempt) -> Result<()> {
        let shop_dir = self.shop_dir(shop);
        fs::create_dir_all(&shop_dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(shop_dir.join("attempts.log"))?;
        let json = serde_json::to_string(attempt)?;
        writeln!(file, "{json}")?;
        fsync_file(&file)?;
        Ok(())
    }

    /// Reads every attempt for a shop, oldest first.
    ///
    /// A torn final line (crash mid-write) is skipped; everything before it
    /// parses.
    pub fn read_attempts(&self, shop: &ShopId) -> Result<Vec<DeliveryAttempt>> {
        let path = self.shop_dir(shop).join("attempts.log");
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut attempts = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<DeliveryAttempt>(trimmed) {
                Ok(attempt) => attempts.push(attempt),
                Err(_) => break,
            }
        }
        Ok(attempts)
    }
}
