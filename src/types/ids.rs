//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! Nonce where an OrderKey is expected) and make the code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A shop identifier.
///
/// Shops are the tenancy unit: every receipt, delivery attempt, nonce, and
/// credential set is scoped to one shop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShopId(pub String);

impl ShopId {
    pub fn new(s: impl Into<String>) -> Self {
        ShopId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ShopId {
    fn from(s: String) -> Self {
        ShopId(s)
    }
}

/// A deterministic event identifier (full SHA-256 hex digest).
///
/// Computed from the canonical event identity so that a client-sent and a
/// server-sent copy of the same logical event collapse to one id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(s: impl Into<String>) -> Self {
        EventId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (8-character) version of the id for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The canonical order-match key for an event.
///
/// Derivation preference: numeric order id, then a hash of the checkout
/// token, then a session-scoped synthetic key. See `dedup::keys`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderKey(pub String);

impl OrderKey {
    pub fn new(s: impl Into<String>) -> Self {
        OrderKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client-supplied replay nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(pub String);

impl Nonce {
    pub fn new(s: impl Into<String>) -> Self {
        Nonce(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named scheduled job guarded by the distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Drain spooled ingest events.
    DrainQueue,
    /// Run the dispatch worker over pending deliveries.
    RunDispatch,
    /// Remove expired queue entries.
    Cleanup,
}

impl LockType {
    /// The shared-store key for this lock.
    pub fn store_key(&self) -> String {
        format!("lock:{}", self.as_str())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::DrainQueue => "drain_queue",
            LockType::RunDispatch => "run_dispatch",
            LockType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An opaque token identifying the current holder of a lock.
///
/// Only the holder that acquired a lock may release or renew it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(pub String);

impl HolderToken {
    pub fn new(s: impl Into<String>) -> Self {
        HolderToken(s.into())
    }

    /// Generates a fresh random holder token.
    pub fn generate() -> Self {
        HolderToken(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
