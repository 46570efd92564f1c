//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::admission_middleware;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiter;

/// Put the admission check in front of every route of `app`.
pub fn with_admission(app: Router, limiter: Arc<RateLimiter>) -> Router {
    app.layer(axum::middleware::from_fn_with_state(
        limiter,
        admission_middleware,
    ))
    .layer(TraceLayer::new_for_http())
}

/// HTTP server that admits requests before handing them to the application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The application router, already wrapped with the admission layer
    router: Router,
}

impl HttpServer {
    /// Create a new server for `app`, guarded by `limiter`.
    pub fn new(addr: SocketAddr, app: Router, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            router: with_admission(app, limiter),
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(addr = %listener.local_addr()?, "Starting HTTP server with admission control");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitPolicy, MemoryStore};
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get_status(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_server_limits_by_peer_address() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            LimitPolicy::new(2, 60),
        ));
        let app = Router::new().route("/", get(|| async { "ok" }));
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), app, limiter);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_on(listener, async move {
            let _ = stop_rx.await;
        }));

        assert_eq!(get_status(addr).await, "HTTP/1.1 200 OK");
        assert_eq!(get_status(addr).await, "HTTP/1.1 200 OK");
        assert_eq!(get_status(addr).await, "HTTP/1.1 429 Too Many Requests");

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
