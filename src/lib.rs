//! Turnstile - Fixed-Window Request Admission Control
//!
//! This crate decides, per inbound HTTP request, whether to forward it to the
//! application or reject it. Quotas are keyed by API token (falling back to
//! the caller's IP) and counted in a shared store with per-window expiry, so
//! any number of instances can enforce one quota together.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
