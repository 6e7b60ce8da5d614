//! Shared external store for cross-instance coordination.
//!
//! All cross-instance state — replay nonces, rate-limit counters, and the
//! distributed batch-job lock — goes through one [`SharedStore`] trait
//! offering atomic primitives: set-if-absent with TTL, check-and-delete,
//! check-and-expire, and a TTL-scoped counter. Nothing about correctness may
//! depend on in-process memory surviving between requests; instances are
//! ephemeral and horizontally scaled.
//!
//! Two implementations exist:
//! - [`redis::RedisStore`]: Redis via `fred`, for production multi-instance
//!   deployments. Check-then-act operations run as embedded Lua scripts.
//! - [`memory::MemoryStore`]: in-process map with lazy TTL expiry, for
//!   single-instance/dev deployments and tests.
//!
//! The store client is explicitly constructed at startup and passed down as
//! an `Arc<dyn SharedStore>`; there is no process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors from the shared store backend.
///
/// Any backend error means the caller must fail closed: a nonce that cannot
/// be checked is treated as replayed, a lock that cannot be acquired is
/// treated as not acquired.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is unreachable or returned a protocol error.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Atomic primitives over the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Sets `key = value` with the given TTL only if the key is absent.
    ///
    /// Returns `true` if the key was set (the caller won the race).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Returns the value stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes `key` only if its current value equals `expected`.
    ///
    /// The compare and the delete are a single atomic step. Returns `true`
    /// if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Resets the TTL of `key` only if its current value equals `expected`.
    ///
    /// The compare and the expiry update are a single atomic step. Returns
    /// `true` if the TTL was updated.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Returns the remaining TTL of `key`, or `None` if the key is absent
    /// or has no expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Increments a counter, setting its TTL on first increment.
    ///
    /// Returns the counter value after the increment. Used for fixed-window
    /// rate limiting.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64>;
}

/// A reference-counted store handle, as passed through the application.
pub type StoreHandle = Arc<dyn SharedStore>;
