use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::{CounterStore, Identity, KeyTtl, RateLimiter, RedisStore, TokenLimits};

/// Fixed-window request admission control backed by Redis.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Store a per-token limit override
    SetLimits {
        /// API token the override applies to
        #[arg(long)]
        token: String,
        /// Requests allowed per window
        #[arg(long)]
        limit: i64,
        /// Window length in seconds
        #[arg(long)]
        ttl: i64,
    },
    /// Show the remaining window of a counter
    Inspect(Target),
    /// Delete a counter, restoring its full quota
    Reset(Target),
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct Target {
    /// API token whose counter to address
    #[arg(long)]
    token: Option<String>,
    /// Client IP whose counter to address
    #[arg(long)]
    ip: Option<String>,
}

impl Target {
    fn identity(&self) -> Identity {
        match (&self.token, &self.ip) {
            (Some(token), _) => Identity::Token(token.clone()),
            (None, ip) => Identity::Ip(ip.clone().unwrap_or_default()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    let store = Arc::new(RedisStore::connect(&config.store).await?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store).await?,
        Command::SetLimits { token, limit, ttl } => {
            store
                .put_token_limits(&token, TokenLimits { limit, ttl_secs: ttl })
                .await?;
            println!("token {token}: limit={limit} ttl={ttl}s");
        }
        Command::Inspect(target) => {
            let key = target.identity().counter_key();
            match store.ttl(key.as_str()).await? {
                KeyTtl::Missing => println!("{key}: no active window"),
                KeyTtl::Persistent => println!("{key}: no expiry set (counter will not reset)"),
                KeyTtl::Expires(remaining) => {
                    println!("{key}: window ends in {:.1}s", remaining.as_secs_f64())
                }
            }
        }
        Command::Reset(target) => {
            let key = target.identity().counter_key();
            store.reset(key.as_str()).await?;
            println!("{key}: reset");
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: TurnstileConfig, store: Arc<RedisStore>) -> anyhow::Result<()> {
    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policy = config.default_policy();
    info!(
        listen_addr = %config.server.listen_addr,
        default_limit = policy.limit,
        default_window = ?policy.window,
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::new(store, policy));
    let app = Router::new().route("/", get(|| async { "Request succeeded!" }));

    HttpServer::new(config.server.listen_addr, app, limiter)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
