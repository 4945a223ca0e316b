mod admin;
mod client;
mod config;
mod forward;
mod proxy;

use admin::{admin_router, AdminState, ProxyStats};
use config::{Config, StoreBackend};
use forward::UpstreamForwarder;
use postgrest_cache::{KvStore, MemoryStore, RedisStore, ResponseStore};
use proxy::{proxy_router, AppState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load config (file, then env overrides)
    let config = match Config::load(Path::new("config.toml")) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "proxy exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Install Prometheus metrics recorder
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // Pick the store backend; Redis connects lazily on first use
    let backend: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::new(&config.redis_settings())?),
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.store.memory_capacity)),
    };
    let store = ResponseStore::new(backend, config.ttl());
    let forwarder = UpstreamForwarder::new(config.upstream_uri()?)?;

    let state = Arc::new(AppState {
        rules: config.table_rules(),
        path_prefix: config.cache.path_prefix.clone(),
        store,
        forwarder,
        stats: ProxyStats::default(),
    });

    // Proxy on the main port, admin/metrics on a separate one
    let proxy_app = proxy_router(Arc::clone(&state));
    let admin_app = admin_router(AdminState {
        app: Arc::clone(&state),
        prometheus,
    });

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        backend = state.store.backend_name(),
        store_addr = %config.store.addr,
        store_password = if config.store.password.is_empty() { "" } else { "[redacted]" },
        store_db = config.store.db,
        ttl_seconds = config.cache.ttl_seconds,
        tables = ?config.cache.tables,
        "postgrest cache proxy starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .map_err(|e| format!("failed to bind proxy to {proxy_addr}: {e}"))?;
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .map_err(|e| format!("failed to bind metrics to {metrics_addr}: {e}"))?;

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    // ConnectInfo feeds X-Forwarded-For
    let proxy_future = axum::serve(
        proxy_listener,
        proxy_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, admin_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    tracing::info!("postgrest cache proxy shut down");
    Ok(())
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}
