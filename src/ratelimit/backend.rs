//! Counter store trait for abstracting in-memory and shared implementations.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by counter store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing service answered with an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// No override record exists for the token.
    #[error("no limit override for token '{0}'")]
    MissingOverride(String),

    /// The override record exists but a field is absent or not an integer.
    #[error("malformed limit override for token '{token}': {reason}")]
    MalformedOverride { token: String, reason: String },
}

/// Remaining lifetime of a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists without an expiry. A counter in this state never resets
    /// on its own.
    Persistent,
    /// The key is deleted after this duration.
    Expires(Duration),
}

/// A per-token override record as persisted by the store.
///
/// Values are stored as signed integers; range validation is the
/// resolver's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimits {
    /// Maximum requests per window
    pub limit: i64,
    /// Window length in seconds
    pub ttl_secs: i64,
}

/// Longest expiry a store attaches to a counter (100 years).
///
/// Longer windows are clamped so they stay representable both as a local
/// `Instant` and as a Redis millisecond TTL.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Clamp a window length to [`MAX_TTL`].
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

/// Outcome of a counted hit.
#[derive(Debug)]
pub struct Hit {
    /// Counter value after this hit.
    pub count: u64,
    /// Set when the hit opened a window but attaching its expiry failed.
    /// The count is still valid.
    pub expiry_error: Option<StoreError>,
}

impl Hit {
    /// A hit whose expiry handling (if any) succeeded.
    pub fn counted(count: u64) -> Self {
        Self {
            count,
            expiry_error: None,
        }
    }
}

/// Shared key-value counter store with atomic increments and per-key expiry.
///
/// Implementations must be safe for unbounded concurrent callers: the counts
/// returned by `increment` for a key form a strict total order.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the counter at `key`, creating it at zero first
    /// if absent. Returns the new value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Set the time-to-live of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Report the remaining lifetime of `key`.
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Delete `key` immediately.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Read the limit override persisted for `token`.
    async fn get_token_limits(&self, token: &str) -> Result<TokenLimits, StoreError>;

    /// Persist a limit override for `token`.
    async fn put_token_limits(&self, token: &str, limits: TokenLimits) -> Result<(), StoreError>;

    /// Count a hit on `key` and attach `ttl` when the hit opens a new window.
    ///
    /// This default runs `increment` and `expire` as two separate calls and is
    /// NOT atomic as a pair. Between them a concurrent caller can observe the
    /// key with no expiry, and if `expire` fails (or the process dies) the key
    /// is left without a TTL and its quota never resets. Backends with a
    /// native conditional primitive should override this.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<Hit, StoreError> {
        let count = self.increment(key).await?;
        if count != 1 {
            return Ok(Hit::counted(count));
        }

        Ok(Hit {
            count,
            expiry_error: self.expire(key, ttl).await.err(),
        })
    }
}

/// Field of an override record holding the request limit.
pub const LIMIT_FIELD: &str = "limit";
/// Field of an override record holding the window length in seconds.
pub const TTL_FIELD: &str = "ttl";

/// Parse the raw fields of an override record.
pub(crate) fn parse_token_limits(
    token: &str,
    limit: Option<&str>,
    ttl: Option<&str>,
) -> Result<TokenLimits, StoreError> {
    let (limit, ttl) = match (limit, ttl) {
        (None, None) => return Err(StoreError::MissingOverride(token.to_string())),
        (Some(limit), Some(ttl)) => (limit, ttl),
        (limit, _) => {
            let missing = if limit.is_none() { LIMIT_FIELD } else { TTL_FIELD };
            return Err(StoreError::MalformedOverride {
                token: token.to_string(),
                reason: format!("missing field `{}`", missing),
            });
        }
    };

    let parse = |field: &str, raw: &str| {
        raw.trim()
            .parse::<i64>()
            .map_err(|e| StoreError::MalformedOverride {
                token: token.to_string(),
                reason: format!("field `{}` = {:?}: {}", field, raw, e),
            })
    };

    Ok(TokenLimits {
        limit: parse(LIMIT_FIELD, limit)?,
        ttl_secs: parse(TTL_FIELD, ttl)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_limits() {
        let limits = parse_token_limits("t", Some("2"), Some("30")).unwrap();
        assert_eq!(limits, TokenLimits { limit: 2, ttl_secs: 30 });
    }

    #[test]
    fn test_parse_token_limits_absent_record() {
        let err = parse_token_limits("t", None, None).unwrap_err();
        assert!(matches!(err, StoreError::MissingOverride(token) if token == "t"));
    }

    #[test]
    fn test_parse_token_limits_missing_field() {
        let err = parse_token_limits("t", Some("2"), None).unwrap_err();
        assert!(matches!(err, StoreError::MalformedOverride { .. }));
        assert!(err.to_string().contains("`ttl`"));

        let err = parse_token_limits("t", None, Some("30")).unwrap_err();
        assert!(err.to_string().contains("`limit`"));
    }

    #[test]
    fn test_parse_token_limits_not_an_integer() {
        let err = parse_token_limits("t", Some("ten"), Some("30")).unwrap_err();
        assert!(matches!(err, StoreError::MalformedOverride { .. }));
    }

    #[test]
    fn test_clamp_ttl() {
        assert_eq!(clamp_ttl(Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(clamp_ttl(Duration::from_secs(i64::MAX as u64)), MAX_TTL);
        assert_eq!(clamp_ttl(Duration::MAX), MAX_TTL);
    }

    #[test]
    fn test_parse_token_limits_keeps_negative_values() {
        let limits = parse_token_limits("t", Some("-1"), Some("-5")).unwrap();
        assert_eq!(limits.limit, -1);
        assert_eq!(limits.ttl_secs, -5);
    }
}
