//! Admission middleware for axum routers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

use crate::ratelimit::{ip_from_remote_addr, Decision, RateLimiter, Rejection};

/// Request header carrying the caller's API token.
pub const API_KEY_HEADER: &str = "api_key";

/// Body of a 429 response.
pub const QUOTA_EXCEEDED_BODY: &str = "429 - you have reached the maximum number of requests";

/// Body of a 500 response.
pub const INTERNAL_ERROR_BODY: &str = "internal server error";

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::QuotaExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, QUOTA_EXCEEDED_BODY).into_response()
            }
            Rejection::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
            }
        }
    }
}

/// The API token of a request, or an empty string.
///
/// Header bytes outside visible ASCII are decoded as UTF-8, with invalid
/// sequences replaced, so such a token still selects its own quota.
fn api_token(req: &Request) -> String {
    let Some(value) = req.headers().get(API_KEY_HEADER) else {
        return String::new();
    };
    match value.to_str() {
        Ok(token) => token.to_string(),
        Err(_) => {
            let token = String::from_utf8_lossy(value.as_bytes()).into_owned();
            debug!(token = %token, "API token is not visible ASCII");
            token
        }
    }
}

/// The caller's IP without port, or an empty string when the connection
/// address is unknown.
fn remote_ip(req: &Request) -> String {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    ip_from_remote_addr(&remote_addr)
}

/// Count the request and either pass it on untouched or answer it directly.
///
/// Serve the router with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the caller's address is available; without it every tokenless caller
/// shares a single quota.
#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn admission_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = remote_ip(&req);
    let token = api_token(&req);
    let decision = limiter.check(&ip, &token).await;

    match decision {
        Decision::Forwarded { count, limit } => {
            debug!(count, limit, "Request admitted");
            next.run(req).await
        }
        Decision::Rejected(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{CounterStore, LimitPolicy, MemoryStore, StoreError, TokenLimits};
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BODY_LIMIT: usize = 64 * 1024;

    fn app(store: Arc<MemoryStore>, limit: u64, hits: Arc<AtomicUsize>) -> Router {
        let limiter = Arc::new(RateLimiter::new(store, LimitPolicy::new(limit, 60)));
        counting_router(limiter, hits)
    }

    fn counting_router(limiter: Arc<RateLimiter>, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "Success"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(limiter, admission_middleware))
    }

    fn request(remote: &str, token: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(remote.parse::<SocketAddr>().unwrap()));
        req
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), BODY_LIMIT)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_request_under_limit_reaches_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Arc::new(MemoryStore::new()), 5, hits.clone());

        let response = app.oneshot(request("192.168.1.1:12345", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Success");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_over_limit_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Arc::new(MemoryStore::new()), 5, hits.clone());

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("192.168.1.2:12345", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request("192.168.1.2:12345", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(response).await, QUOTA_EXCEEDED_BODY);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_port_is_not_part_of_identity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Arc::new(MemoryStore::new()), 1, hits);

        let first = app.clone().oneshot(request("10.0.0.9:1000", None)).await.unwrap();
        let second = app.oneshot(request("10.0.0.9:2000", None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_ipv6_peer_is_keyed_without_brackets() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone(), 5, Arc::new(AtomicUsize::new(0)));

        let response = app.oneshot(request("[::1]:4444", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.current_count("rate-limiter:ip:::1"), Some(1));
    }

    #[tokio::test]
    async fn test_token_header_selects_token_quota() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_token_limits("custom_token", TokenLimits { limit: 2, ttl_secs: 30 })
            .await
            .unwrap();
        let app = app(store.clone(), 5, Arc::new(AtomicUsize::new(0)));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request("192.168.1.3:12345", Some("custom_token")))
                .await
                .unwrap();
            statuses.push(response.status());
        }

        assert_eq!(
            statuses,
            vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
        );
        assert_eq!(store.current_count("rate-limiter:token:custom_token"), Some(3));
        assert_eq!(store.current_count("rate-limiter:ip:192.168.1.3"), None);
    }

    #[tokio::test]
    async fn test_non_ascii_token_keeps_its_own_quota() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone(), 5, Arc::new(AtomicUsize::new(0)));

        let mut req = request("192.168.1.5:12345", None);
        req.headers_mut().insert(
            API_KEY_HEADER,
            axum::http::HeaderValue::from_bytes("café".as_bytes()).unwrap(),
        );
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut req = request("192.168.1.5:12345", None);
        req.headers_mut().insert(
            API_KEY_HEADER,
            axum::http::HeaderValue::from_bytes(b"key\xff").unwrap(),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(store.current_count("rate-limiter:token:café"), Some(1));
        assert_eq!(store.current_count("rate-limiter:token:key\u{fffd}"), Some(1));
        assert_eq!(store.current_count("rate-limiter:ip:192.168.1.5"), None);
    }

    #[tokio::test]
    async fn test_missing_connect_info_uses_shared_bucket() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone(), 5, Arc::new(AtomicUsize::new(0)));

        let req = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.current_count("rate-limiter:ip:"), Some(1));
    }

    #[tokio::test]
    async fn test_store_failure_returns_internal_error() {
        struct BrokenStore;

        #[async_trait::async_trait]
        impl CounterStore for BrokenStore {
            async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn expire(&self, _key: &str, _ttl: std::time::Duration) -> Result<(), StoreError> {
                Ok(())
            }
            async fn ttl(&self, _key: &str) -> Result<crate::ratelimit::KeyTtl, StoreError> {
                Ok(crate::ratelimit::KeyTtl::Missing)
            }
            async fn reset(&self, _key: &str) -> Result<(), StoreError> {
                Ok(())
            }
            async fn get_token_limits(&self, token: &str) -> Result<TokenLimits, StoreError> {
                Err(StoreError::MissingOverride(token.to_string()))
            }
            async fn put_token_limits(&self, _token: &str, _limits: TokenLimits) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let limiter = Arc::new(RateLimiter::new(Arc::new(BrokenStore), LimitPolicy::new(5, 60)));
        let app = counting_router(limiter, hits.clone());

        let response = app.oneshot(request("192.168.1.4:12345", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, INTERNAL_ERROR_BODY);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
