//! Rate limiting logic and counter storage.

mod backend;
mod counter;
mod identity;
mod limiter;
mod policy;
pub mod redis_store;

pub use backend::{
    clamp_ttl, CounterStore, Hit, KeyTtl, StoreError, TokenLimits, LIMIT_FIELD, MAX_TTL, TTL_FIELD,
};
pub use counter::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
pub use identity::{ip_from_remote_addr, CounterKey, Identity, KEY_PREFIX};
pub use limiter::{Decision, RateLimiter, Rejection};
pub use policy::{LimitPolicy, PolicyResolver, Resolution};
pub use redis_store::RedisStore;
