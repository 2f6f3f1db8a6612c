//! Gateway entry point: config, logging, catalog bootstrap, HTTP server.

use anyhow::Context as _;
use clap::Parser as _;
use mcpmux_gateway::app::build_app;
use mcpmux_gateway::auth::AuthState;
use mcpmux_gateway::builtin::load_builtin_servers;
use mcpmux_gateway::catalog::{Catalog, PostgresCatalog};
use mcpmux_gateway::config::{CliArgs, Config, LoggingSection};
use mcpmux_gateway::handlers::HandlerRegistry;
use mcpmux_gateway::router::SessionRouter;
use mcpmux_gateway::upstream::sse::SseUpstreamManager;
use mcpmux_gateway::upstream::stdio::StdioUpstreamManager;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }

    init_logging(&config.logging)?;
    tracing::info!(version = VERSION, addr = %config.server.addr(), "starting MCP gateway");

    // Catalog bootstrap; a failure here exits non-zero.
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_open_conns)
        .connect(&config.database.url())
        .await
        .context("failed to connect to catalog database")?;
    tracing::info!("connected to catalog database");

    let catalog: Arc<dyn Catalog> =
        Arc::new(PostgresCatalog::new(pool, config.remote.clone()));
    let registry = HandlerRegistry::new(catalog.clone());

    let builtin = load_builtin_servers(&catalog, &registry)
        .await
        .context("failed to load builtin servers from catalog")?;

    let ct = CancellationToken::new();
    let stdio = Arc::new(StdioUpstreamManager::new(
        catalog.clone(),
        config.remote.clone(),
        ct.child_token(),
    ));
    let sse = Arc::new(SseUpstreamManager::new(
        catalog.clone(),
        config.remote.clone(),
        ct.child_token(),
    ));
    let router = SessionRouter::new(
        catalog,
        stdio.clone(),
        sse.clone(),
        builtin,
        config.session.clone(),
        ct.child_token(),
    );

    let auth = AuthState::new(&config.auth);
    tracing::info!(
        enabled = auth.is_enabled(),
        header = auth.header_name(),
        "API-key authentication"
    );
    let app = build_app(router.clone(), auth);

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "server listening");

    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_ct.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(ct.clone().cancelled_owned())
        .await
        .context("http server failed")?;

    // Close upstreams after in-flight requests drained.
    router.shutdown();
    stdio.shutdown().await;
    sse.shutdown().await;

    tracing::info!("gateway shut down gracefully");
    Ok(())
}

fn init_logging(logging: &LoggingSection) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = logging.format.eq_ignore_ascii_case("json");

    match logging.file.as_deref().filter(|f| !f.is_empty()) {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            let writer = Arc::new(file);
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .init();
            }
        }
        None => {
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().with_target(true))
                    .init();
            }
        }
    }
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
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
        () = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
