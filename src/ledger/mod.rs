//! The delivery ledger: durable receipts and the append-only attempts log.
//!
//! Layout under `<data_dir>/ledger/<shop>/`:
//!
//! - `receipts/<event_id>.json` — one file per recorded event.
//! - `guards/<hash>.guard` — exclusive-create markers enforcing the
//!   per-(shop, order, event type) uniqueness constraint for purchases. The
//!   marker holds the winning event id.
//! - `attempts.log` — JSON Lines, one object per delivery attempt.
//!
//! Uniqueness is enforced by the filesystem: `O_CREAT|O_EXCL` makes the
//! receipt write atomic, so when two concurrent requests both pass the dedup
//! pre-check, exactly one wins and the loser observes `AlreadyRecorded`.
//! Receipts and attempts are never deleted by this crate.

mod fsync;

pub mod attempt;
pub mod receipt;

pub use attempt::{AttemptStatus, DeliveryAttempt};
pub use receipt::{EventReceipt, RecordOutcome};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::ShopId;

/// Errors from ledger reads and writes.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Handle to the on-disk ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    /// Creates a ledger rooted at `<data_dir>/ledger`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join("ledger"),
        }
    }

    pub(crate) fn shop_dir(&self, shop: &ShopId) -> PathBuf {
        self.root.join(shop.as_str())
    }

    /// Shops that have any ledger data at all.
    pub fn shops(&self) -> Result<Vec<ShopId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut shops = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                shops.push(ShopId::new(name));
            }
        }
        shops.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(shops)
    }
}
