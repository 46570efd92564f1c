//! Redis-backed counter store.
//!
//! Counters are plain Redis integers with native `INCR` and key expiry, so
//! every instance pointing at the same server shares one quota per identity.
//! Token overrides are hashes at `token:<token>` with `limit` and `ttl` fields.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo, RedisError, Script};
use tracing::{debug, info};

use super::backend::{
    clamp_ttl, parse_token_limits, CounterStore, Hit, KeyTtl, StoreError, TokenLimits, LIMIT_FIELD, TTL_FIELD,
};
use crate::config::StoreConfig;

/// Increment a counter and attach its expiry in one server-side step.
///
/// The expiry is set on the first hit of a window, and also whenever the key
/// is found without one, so a counter can never be left persistent.
///
/// Returns `{count, error}`. A rejected `PEXPIRE` does not undo the
/// increment; its message comes back in `error` (empty on success).
const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
local err = ''
if count == 1 or redis.call('PTTL', KEYS[1]) == -1 then
    local reply = redis.pcall('PEXPIRE', KEYS[1], ARGV[1])
    if type(reply) == 'table' and reply.err then
        err = reply.err
    end
end
return {count, err}
"#;

/// Key of the override hash for a token.
pub fn override_key(token: &str) -> String {
    format!("token:{}", token)
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Window length as a `PEXPIRE` argument, clamped to [`MAX_TTL`](super::MAX_TTL).
fn window_millis(ttl: Duration) -> i64 {
    i64::try_from(clamp_ttl(ttl).as_millis()).unwrap_or(i64::MAX)
}

/// A [`CounterStore`] backed by a Redis server.
///
/// Cloning is cheap; clones share the same multiplexed connection, which
/// reconnects on its own after failures.
#[derive(Clone)]
pub struct RedisStore {
    /// Multiplexed, auto-reconnecting connection
    conn: ConnectionManager,
    /// Atomic increment-and-expire script
    increment_script: Script,
}

impl RedisStore {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let info = connection_info(config)?;
        info!(host = %config.redis_host, db = config.redis_db, "Connecting to Redis");

        let client = Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    /// Wrap an existing connection.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
        }
    }
}

/// Build connection settings from the store configuration.
pub fn connection_info(config: &StoreConfig) -> Result<ConnectionInfo, StoreError> {
    let mut info = format!("redis://{}/{}", config.redis_host, config.redis_db)
        .into_connection_info()
        .map_err(|e| StoreError::Unavailable(format!("invalid Redis address: {}", e)))?;
    info.redis.password = config.redis_password.clone().filter(|p| !p.is_empty());
    Ok(info)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: bool = conn.pexpire(key, window_millis(ttl)).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut conn = self.conn.clone();
        let ms: i64 = conn.pttl(key).await?;
        Ok(match ms {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        debug!(key = %key, removed, "Reset counter");
        Ok(())
    }

    async fn get_token_limits(&self, token: &str) -> Result<TokenLimits, StoreError> {
        let mut conn = self.conn.clone();
        let (limit, ttl): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(override_key(token))
            .arg(LIMIT_FIELD)
            .arg(TTL_FIELD)
            .query_async(&mut conn)
            .await?;
        parse_token_limits(token, limit.as_deref(), ttl.as_deref())
    }

    async fn put_token_limits(&self, token: &str, limits: TokenLimits) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(override_key(token))
            .arg(LIMIT_FIELD)
            .arg(limits.limit)
            .arg(TTL_FIELD)
            .arg(limits.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<Hit, StoreError> {
        let mut conn = self.conn.clone();
        let (count, expiry_error): (u64, String) = self
            .increment_script
            .key(key)
            .arg(window_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        if expiry_error.is_empty() {
            Ok(Hit::counted(count))
        } else {
            Ok(Hit {
                count,
                expiry_error: Some(StoreError::Backend(expiry_error)),
            })
        }
    }
}
