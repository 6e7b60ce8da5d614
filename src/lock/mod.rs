//! Distributed TTL mutex over the shared store.
//!
//! Guarantees at-most-one concurrent execution of a named scheduled job
//! across horizontally-scaled instances. The lock record lives in the shared
//! store: `lock:<type>` → holder token, with a TTL so a crashed holder never
//! wedges the job forever.
//!
//! # Atomicity
//!
//! - `acquire` is a set-if-absent with expiry.
//! - `release` and `renew` are check-then-act against the holder token, run
//!   as a single atomic step in the store (a Lua script on Redis). Without
//!   this, a second instance could steal an about-to-expire lock mid-release.
//!
//! # Failure bias
//!
//! If the store itself is unreachable, acquisition fails closed: the job is
//! treated as not acquired. Duplicate scheduled runs are worse than skipped
//! ones; an external scheduler retries the whole invocation later.
//!
//! # State machine
//!
//! `unlocked → held(holder, expiry)` on acquire;
//! `held → held(holder, new expiry)` on renew by the same holder;
//! `held → unlocked` on release by the same holder or on natural TTL expiry.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{StoreError, StoreHandle};
use crate::types::{HolderToken, LockType};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The store backend failed; the lock state is unknown. Fail closed.
    #[error("lock backend error: {0}")]
    Backend(#[from] StoreError),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Outcome of an acquisition attempt.
///
/// Contention is a normal outcome, not an error: another holder legitimately
/// running the job is expected under horizontal scaling.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This holder now owns the lock.
    Acquired,
    /// Another holder owns the lock; `remaining` is its time to expiry.
    Held { remaining: Duration },
}

/// Outcome of a lock-guarded job run.
#[derive(Debug)]
pub enum JobOutcome<T> {
    /// The lock was acquired and the job ran to completion.
    Completed(T),
    /// The lock was held elsewhere; the job was skipped.
    Skipped { remaining: Duration },
}

/// The distributed mutex, parameterized by a shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: StoreHandle,
}

impl DistributedLock {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Attempts to acquire `lock_type` for `holder` with the given TTL.
    ///
    /// On contention, returns the remaining TTL of the existing holder as a
    /// machine-readable reason. A remaining TTL of zero is reported as one
    /// millisecond so callers can distinguish "held" from "free".
    pub async fn acquire(
        &self,
        lock_type: LockType,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        let key = lock_type.store_key();
        if self.store.set_if_absent(&key, holder.as_str(), ttl).await? {
            debug!(lock = %lock_type, holder = %holder, "lock acquired");
            return Ok(AcquireOutcome::Acquired);
        }

        let remaining = self
            .store
            .remaining_ttl(&key)
            .await?
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));
        debug!(lock = %lock_type, remaining_ms = remaining.as_millis() as u64, "lock held elsewhere");
        Ok(AcquireOutcome::Held { remaining })
    }

    /// Releases `lock_type` if `holder` currently owns it.
    ///
    /// Returns `true` if the lock was released. `false` means the lock had
    /// already expired or belongs to another holder; neither is an error.
    pub async fn release(&self, lock_type: LockType, holder: &HolderToken) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&lock_type.store_key(), holder.as_str())
            .await?;
        debug!(lock = %lock_type, holder = %holder, released, "lock release");
        Ok(released)
    }

    /// Extends the TTL of `lock_type` if `holder` currently owns it.
    pub async fn renew(
        &self,
        lock_type: LockType,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .compare_and_expire(&lock_type.store_key(), holder.as_str(), ttl)
            .await
            .map_err(LockError::from)
    }

    /// Runs `job` under the lock, releasing it on every exit path.
    ///
    /// A renewal timer fires at roughly half the TTL for jobs expected to
    /// outlive one TTL period. The lock is released after the job completes
    /// whether it succeeded or returned an error value; if the release
    /// itself fails (or the task is cancelled mid-job), the TTL reclaims
    /// the lock.
    pub async fn run_exclusive<F, T>(
        &self,
        lock_type: LockType,
        ttl: Duration,
        job: F,
    ) -> Result<JobOutcome<T>>
    where
        F: Future<Output = T>,
    {
        let holder = HolderToken::generate();

        match self.acquire(lock_type, &holder, ttl).await? {
            AcquireOutcome::Held { remaining } => return Ok(JobOutcome::Skipped { remaining }),
            AcquireOutcome::Acquired => {}
        }

        // Renew on a timer at half the TTL so long jobs keep ownership.
        let cancel = CancellationToken::new();
        let renew_handle = {
            let lock = self.clone();
            let holder = holder.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let interval = ttl / 2;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            match lock.renew(lock_type, &holder, ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(lock = %lock_type, "lock renewal lost ownership");
                                    break;
                                }
                                Err(err) => {
                                    warn!(lock = %lock_type, error = %err, "lock renewal failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        };

        let result = job.await;

        cancel.cancel();
        let _ = renew_handle.await;

        if let Err(err) = self.release(lock_type, &holder).await {
            // The TTL will reclaim the lock; nothing more to do here.
            warn!(lock = %lock_type, error = %err, "lock release failed");
        }

        Ok(JobOutcome::Completed(result))
    }
}
