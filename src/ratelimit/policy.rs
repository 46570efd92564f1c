//! Limit policies and per-request policy resolution.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::backend::{CounterStore, TokenLimits};
use super::identity::{CounterKey, Identity};

/// A quota: at most `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    /// Maximum requests allowed in the window. Zero rejects everything.
    pub limit: u64,
    /// Length of a counting window
    pub window: Duration,
}

impl LimitPolicy {
    /// Create a policy from a limit and a window length in seconds.
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Build a policy from a stored override record.
    ///
    /// Returns `None` unless the limit is positive and the window is not
    /// negative.
    pub fn from_override(limits: TokenLimits) -> Option<Self> {
        let limit = u64::try_from(limits.limit).ok().filter(|l| *l > 0)?;
        let window_secs = u64::try_from(limits.ttl_secs).ok()?;
        Some(Self::new(limit, window_secs))
    }
}

/// The counter key and policy that apply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Identity the request is counted against
    pub identity: Identity,
    /// Store key of that identity's counter
    pub key: CounterKey,
    /// Quota to enforce
    pub policy: LimitPolicy,
}

/// Resolves requester identity and the quota that applies to it.
#[derive(Clone)]
pub struct PolicyResolver {
    /// Store holding per-token overrides
    store: Arc<dyn CounterStore>,
    /// Policy for IP identities and tokens without a valid override
    default_policy: LimitPolicy,
}

impl PolicyResolver {
    /// Create a resolver with the process-wide default policy.
    pub fn new(store: Arc<dyn CounterStore>, default_policy: LimitPolicy) -> Self {
        Self {
            store,
            default_policy,
        }
    }

    /// The policy applied when no override exists.
    pub fn default_policy(&self) -> LimitPolicy {
        self.default_policy
    }

    /// Resolve the counter key and policy for a request.
    ///
    /// Reads the store only when a token is present. A failed or invalid
    /// override lookup falls back to the default policy and never fails the
    /// request.
    pub async fn resolve(&self, ip: &str, token: &str) -> Resolution {
        let identity = Identity::new(ip, token);
        let key = identity.counter_key();

        let policy = match identity.token() {
            Some(token) => self.token_policy(token).await,
            None => self.default_policy,
        };

        trace!(
            key = %key,
            limit = policy.limit,
            window = ?policy.window,
            "Resolved limit policy"
        );

        Resolution {
            identity,
            key,
            policy,
        }
    }

    async fn token_policy(&self, token: &str) -> LimitPolicy {
        match self.store.get_token_limits(token).await {
            Ok(limits) => LimitPolicy::from_override(limits).unwrap_or_else(|| {
                debug!(
                    limit = limits.limit,
                    ttl = limits.ttl_secs,
                    "Ignoring out-of-range token override"
                );
                self.default_policy
            }),
            Err(e) => {
                debug!(error = %e, "No usable token override, using default policy");
                self.default_policy
            }
        }
    }
}
