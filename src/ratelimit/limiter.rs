//! Core admission decision.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::backend::{CounterStore, StoreError};
use super::identity::CounterKey;
use super::policy::{LimitPolicy, PolicyResolver};

/// Why a request was turned away.
#[derive(Debug)]
pub enum Rejection {
    /// The identity used up its quota for the current window.
    QuotaExceeded {
        /// Counter key that tripped
        key: CounterKey,
        /// Count after this request
        count: u64,
        /// Limit in force
        limit: u64,
    },
    /// The request could not be counted.
    Store(StoreError),
}

/// Outcome of an admission check.
#[derive(Debug)]
pub enum Decision {
    /// Pass the request on to the downstream handler.
    Forwarded {
        /// Count after this request
        count: u64,
        /// Limit in force
        limit: u64,
    },
    /// Answer the request without calling the downstream handler.
    Rejected(Rejection),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Decision::Forwarded { .. })
    }
}

/// Fixed-window admission control over a shared [`CounterStore`].
///
/// Each check costs one counted hit, so a request that is later abandoned by
/// its client still consumes quota. Counts for a key are ordered by the store;
/// the limiter itself holds no locks and caches nothing.
///
/// The window is fixed, not sliding: up to `2 * limit` requests can pass
/// around a rollover (the tail of one window plus the head of the next).
#[derive(Clone)]
pub struct RateLimiter {
    /// Shared counter store
    store: Arc<dyn CounterStore>,
    /// Identity and policy resolution
    resolver: PolicyResolver,
}

impl RateLimiter {
    /// Create a rate limiter over `store` with the given default policy.
    pub fn new(store: Arc<dyn CounterStore>, default_policy: LimitPolicy) -> Self {
        let resolver = PolicyResolver::new(store.clone(), default_policy);
        Self { store, resolver }
    }

    /// The resolver used for identity and policy lookup.
    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Count a request and decide whether it is admitted.
    ///
    /// `ip` is the caller's address without port and `token` the raw API
    /// token (empty when absent). Only a failed increment rejects with a store
    /// error; a failed expiry is logged and the request is judged on its
    /// count.
    pub async fn check(&self, ip: &str, token: &str) -> Decision {
        let resolution = self.resolver.resolve(ip, token).await;
        let key = resolution.key;
        let policy = resolution.policy;

        let hit = match self
            .store
            .increment_with_expiry(key.as_str(), policy.window)
            .await
        {
            Ok(hit) => hit,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to count request");
                return Decision::Rejected(Rejection::Store(e));
            }
        };

        if let Some(e) = &hit.expiry_error {
            warn!(
                key = %key,
                window = ?policy.window,
                error = %e,
                "Failed to set counter expiry; window may outlive its length"
            );
        }

        trace!(key = %key, count = hit.count, limit = policy.limit, "Counted request");

        if hit.count > policy.limit {
            debug!(
                key = %key,
                count = hit.count,
                limit = policy.limit,
                "Rate limit exceeded"
            );
            return Decision::Rejected(Rejection::QuotaExceeded {
                key,
                count: hit.count,
                limit: policy.limit,
            });
        }

        Decision::Forwarded {
            count: hit.count,
            limit: policy.limit,
        }
    }
}
