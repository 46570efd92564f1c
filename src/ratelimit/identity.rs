//! Requester identity and counter key generation.

use std::fmt;
use std::net::SocketAddr;

/// Namespace prefix shared by every counter key.
///
/// Existing counters in the store are addressed through this prefix, so it
/// must not change without migrating them.
pub const KEY_PREFIX: &str = "rate-limiter";

/// The dimension a quota is partitioned by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Caller-supplied API token
    Token(String),
    /// Transport-level source address
    Ip(String),
}

impl Identity {
    /// Pick the identity for a request. A non-empty token always wins over
    /// the IP; the two are never combined.
    pub fn new(ip: &str, token: &str) -> Self {
        if token.is_empty() {
            Identity::Ip(ip.to_string())
        } else {
            Identity::Token(token.to_string())
        }
    }

    /// The token, if this identity is token-based.
    pub fn token(&self) -> Option<&str> {
        match self {
            Identity::Token(token) => Some(token.as_str()),
            Identity::Ip(_) => None,
        }
    }

    /// The counter key for this identity.
    pub fn counter_key(&self) -> CounterKey {
        CounterKey::from(self)
    }
}

/// A key that uniquely identifies a counter in the store.
///
/// Token and IP keys live under different namespaces, so a token and an IP
/// with the same text never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// The key as sent to the store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Identity> for CounterKey {
    fn from(identity: &Identity) -> Self {
        let key = match identity {
            Identity::Token(token) => format!("{}:token:{}", KEY_PREFIX, token),
            Identity::Ip(ip) => format!("{}:ip:{}", KEY_PREFIX, ip),
        };
        CounterKey(key)
    }
}

impl AsRef<str> for CounterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the IP from a `host:port` remote address, dropping the port.
///
/// Returns an empty string when the address has no port or cannot be split.
/// All such callers end up sharing the `rate-limiter:ip:` counter.
pub fn ip_from_remote_addr(remote_addr: &str) -> String {
    if let Ok(addr) = remote_addr.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }

    // Bracketed hosts: "[host]:port"
    if let Some(rest) = remote_addr.strip_prefix('[') {
        return match rest.split_once("]:") {
            Some((host, _port)) => host.to_string(),
            None => String::new(),
        };
    }

    match remote_addr.rsplit_once(':') {
        Some((host, _port)) if !host.contains(':') => host.to_string(),
        _ => String::new(),
    }
}
