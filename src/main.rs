use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod adapters;
mod api;
mod catalog;
mod config;
mod dispatch;
mod error;
mod health;
mod registry;
mod routing;
mod scheduler;
mod state;
mod store;
mod tags;
#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{AppError, RouteError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lm_router=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("LMR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/lm-router/config.yaml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config = Arc::new(config);

    info!(
        port = config.server.port,
        providers = config.providers.len(),
        channels = config.channels.len(),
        "lm-router starting"
    );

    // Explicit construction — every component receives its collaborators,
    // nothing is reached through globals.
    let registry = Arc::new(registry::ChannelRegistry::new(&config));
    let catalog = Arc::new(catalog::ModelCatalog::new());
    let blacklist = Arc::new(routing::blacklist::Blacklist::new());
    let health_tracker = Arc::new(health::HealthTracker::new());
    let key_tracker = Arc::new(health::KeyTracker::new());
    let store = Arc::new(store::SnapshotStore::new(&config.server.cache_dir));

    // Warm start: yesterday's snapshots are hints, not truth — discovery
    // replaces them on its first run.
    let warmed = store.load_snapshots();
    if !warmed.is_empty() {
        info!(snapshots = warmed.len(), "warm-starting catalog from disk");
        for snapshot in warmed {
            catalog.insert_snapshot(snapshot);
        }
    }

    let router = Arc::new(routing::Router::new(
        Arc::clone(&registry),
        Arc::clone(&catalog),
        Arc::clone(&blacklist),
        Arc::clone(&health_tracker),
        Arc::clone(&key_tracker),
        config.routing.clone(),
    ));
    let dispatcher = Arc::new(dispatch::Dispatcher::new(
        registry,
        health_tracker,
        blacklist,
        key_tracker,
        &config.server,
    ));

    let task_ctx = scheduler::TaskContext::new(Arc::clone(&router), store, &config);
    let sched = scheduler::Scheduler::new(task_ctx, &config);
    let task_stats = sched.stats_handle();
    tokio::spawn(sched.run());

    let app_state = Arc::new(state::GatewayState::new(
        Arc::clone(&config),
        router,
        dispatcher,
        task_stats,
    ));

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::client::router(Arc::clone(&app_state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&app_state),
            api::client_auth::client_auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&app_state),
            api::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `lm-router --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LMR_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => std::process::exit(0),
        Ok(resp) => {
            warn!(status = %resp.status(), "healthcheck failed");
            std::process::exit(1);
        }
        Err(e) => {
            warn!(error = %e, "healthcheck unreachable");
            std::process::exit(1);
        }
    }
}
