//! Redis-backed shared store via `fred`.
//!
//! Production deployments run many instances against one Redis; this is the
//! single source of truth for "has this already happened". Plain
//! set-if-absent maps to `SET NX PX`; the check-then-act operations
//! (release/renew) run as embedded Lua scripts so the compare and the
//! mutation are one atomic step server-side.
//!
//! Every error from the client is surfaced as [`StoreError::Backend`]; the
//! callers (replay guard, distributed lock) fail closed on it.

use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::Expiration;

use super::{Result, SharedStore, StoreError};

/// Compare-and-delete: deletes KEYS[1] only when its value equals ARGV[1].
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end
"#;

/// Compare-and-expire: resets the TTL of KEYS[1] (ARGV[2] ms) only when its
/// value equals ARGV[1].
const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('pexpire', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Increment with TTL attached on first touch. One script so a crash between
/// the INCR and the PEXPIRE cannot leave a counter without an expiry.
const INCR_TTL_SCRIPT: &str = r#"
local count = redis.call('incr', KEYS[1])
if count == 1 then
  redis.call('pexpire', KEYS[1], ARGV[1])
end
return count
"#;

/// A [`SharedStore`] backed by a Redis connection pool.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Connects a pool to the given Redis URL and waits for it to be ready.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let config = Config::from_url(url).map_err(map_err)?;

        let pool = Builder::from_config(config)
            .with_connection_config(|cfg| {
                cfg.connection_timeout = Duration::from_secs(5);
                cfg.internal_command_timeout = Duration::from_secs(5);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 10_000, 2))
            .build_pool(pool_size)
            .map_err(map_err)?;

        pool.init().await.map_err(map_err)?;
        pool.wait_for_connect().await.map_err(map_err)?;

        Ok(Self { pool })
    }

    /// Tears the pool down. Called at shutdown.
    pub async fn quit(&self) {
        let _ = self.pool.quit().await;
    }
}

fn map_err(err: Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self
            .pool
            .set(
                key,
                value,
                Some(Expiration::PX(ttl_millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(map_err)?;
        // SET NX replies OK on success, nil when the key already exists.
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.pool.get(key).await.map_err(map_err)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let deleted: i64 = self
            .pool
            .eval(RELEASE_SCRIPT, vec![key.to_string()], vec![expected.to_string()])
            .await
            .map_err(map_err)?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let renewed: i64 = self
            .pool
            .eval(
                RENEW_SCRIPT,
                vec![key.to_string()],
                vec![expected.to_string(), ttl_millis(ttl).to_string()],
            )
            .await
            .map_err(map_err)?;
        Ok(renewed == 1)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let millis: i64 = self.pool.pttl(key).await.map_err(map_err)?;
        // PTTL replies -2 when the key is absent, -1 when it has no expiry.
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64> {
        let count: i64 = self
            .pool
            .eval(
                INCR_TTL_SCRIPT,
                vec![key.to_string()],
                vec![ttl_millis(ttl).to_string()],
            )
            .await
            .map_err(map_err)?;
        Ok(count.max(0) as u64)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}
