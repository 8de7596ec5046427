//! Ubisoft Session Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Ubisoft credential sets from config
//! 2. Logs each one in and keeps its session ticket renewed in the background
//! 3. Listens for incoming requests
//! 4. Stamps each with the next session ticket (round-robin) and proxies it
//!    to public-ubiservices.ubi.com

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use transport::ReqwestTransport;
use ubi_pool::AuthorizationProvider;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::ProxyState;

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Request counters shown on `/health`.
#[derive(Clone)]
struct ServiceMetrics {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    provider: Arc<AuthorizationProvider>,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(
        provider: Arc<AuthorizationProvider>,
        upstream_url: String,
        timeout: Duration,
        prometheus: PrometheusHandle,
    ) -> Self {
        let metrics = ServiceMetrics::new();
        Self {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url,
                timeout,
                provider: provider.clone(),
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
                in_flight: metrics.in_flight.clone(),
            },
            metrics,
            provider,
            prometheus,
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit caps simultaneous requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ubi-session-proxy");

    // Installed before the pool so login metrics are captured from the start
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        login_url = %config.auth.login_url,
        credentials = config.credential_sets.len(),
        admin = config.admin.is_some(),
        "configuration loaded"
    );

    let timeout = Duration::from_secs(config.proxy.timeout_secs);
    let transport = Arc::new(ReqwestTransport::new(reqwest::Client::new()).with_timeout(timeout));
    let provider = Arc::new(
        AuthorizationProvider::builder(transport)
            .credentials(config.credential_sets)
            .login_endpoint(config.auth.login_endpoint())
            .policy(config.auth.policy())
            .build(),
    );

    provider.init().await;
    let health = provider.health();
    info!(
        status = %health["status"],
        ready = %health["identities_ready"],
        "session pool ready"
    );

    let app_state = AppState::new(
        provider.clone(),
        config.proxy.upstream_url.clone(),
        timeout,
        prometheus_handle,
    );
    let in_flight = app_state.metrics.in_flight.clone();
    let app = build_router(app_state, config.proxy.max_connections);

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;

    if let Some(admin) = &config.admin {
        let admin_listener = TcpListener::bind(admin.listen_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {}", admin.listen_addr))?;
        let admin_app = build_admin_router(AdminState::new(provider.clone()));
        info!(addr = %admin.listen_addr, "admin API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app).await {
                error!(error = %e, "admin server failed");
            }
        });
    }

    info!(addr = %config.proxy.listen_addr, "accepting requests");

    // The drain timeout starts when the signal fires, not when the server starts
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    // Stops the refresh tasks
    drop(provider);

    info!("shutdown complete");
    Ok(())
}

/// Pool health plus uptime and request counters.
/// Returns 200 unless no identity has a session ticket (503).
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.provider.health();
    let status_code = if body["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    body["uptime_seconds"] = state.metrics.started_at.elapsed().as_secs().into();
    body["requests_served"] = state.metrics.requests_total.load(Ordering::Relaxed).into();
    body["errors_total"] = state.metrics.errors_total.load(Ordering::Relaxed).into();

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-health requests to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
