//! Fleet control plane server entry point.
//!
//! Bootstraps the store, host registry, placement engine, and provisioner,
//! then starts the Axum HTTP server alongside three independent background
//! loops (scaler, reconciler, garbage collector) with graceful shutdown.
//! No HTTP request ever invokes a control loop directly — the loops are the
//! only path that advances a lease's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use chrono::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_core::adapters::{ControllerAdapter, FakeControllerAdapter, NodeAgentClient};
use fleet_core::gc::{Gc, GcConfig};
use fleet_core::host::HostRegistry;
use fleet_core::placement::{MapRouter, Placement};
use fleet_core::provisioner::{Provisioner, ProvisionerConfig};
use fleet_core::reconciler::{Reconciler, ReconcilerConfig};
use fleet_core::scaler::{Scaler, ScalerConfig};
use fleet_storage::{MemoryStore, Store};

use fleet_server::config::{ServerConfig, StorageBackendType};
use fleet_server::hardening;
use fleet_server::middleware::auth_middleware;
use fleet_server::routes;
use fleet_server::state::AppState;

use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Production hardening: disable core dumps (always) and lock memory
    // (unless disabled). Runs before logging is initialized, so warnings
    // go to stderr directly.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "fleet control plane starting");

    let (state, scaler, reconciler, gc) = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let background_handles = if config.disable_background_loops {
        info!("background control loops disabled via DISABLE_BACKGROUND_LOOPS");
        Vec::new()
    } else {
        vec![
            spawn_loop("scaler", config.loop_interval, shutdown_rx.clone(), move || {
                let scaler = Arc::clone(&scaler);
                async move { scaler.tick().await }
            }),
            spawn_loop("reconciler", config.loop_interval, shutdown_rx.clone(), move || {
                let reconciler = Arc::clone(&reconciler);
                async move {
                    match reconciler.tick().await {
                        Ok(counts) => info!(?counts, "reconciler tick complete"),
                        Err(error) => warn!(%error, "reconciler tick failed"),
                    }
                }
            }),
            spawn_loop("gc", config.gc_interval, shutdown_rx.clone(), move || {
                let gc = Arc::clone(&gc);
                async move {
                    match gc.tick().await {
                        Ok(counts) => info!(?counts, "gc tick complete"),
                        Err(error) => warn!(%error, "gc tick failed"),
                    }
                }
            }),
        ]
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "fleet control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background loops to stop");
    for handle in background_handles {
        let _ = tokio::time::timeout(StdDuration::from_secs(10), handle).await;
    }

    info!("fleet control plane stopped");
    Ok(())
}

/// Spawn a named background loop that ticks every `interval` until
/// `shutdown` fires, mirroring the retry-worker shape used for the lease
/// scan loop: a `tokio::select!` between the interval and the shutdown
/// signal, nothing more.
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: StdDuration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        info!(loop_name = name, interval_secs = interval.as_secs(), "loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick().await;
                }
                _ = shutdown.changed() => {
                    info!(loop_name = name, "loop shutting down");
                    return;
                }
            }
        }
    })
}

type AppBundle = (Arc<AppState>, Arc<Scaler>, Arc<Reconciler>, Arc<Gc>);

/// Build the shared application state and the three control loops.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<AppBundle> {
    let store: Arc<dyn Store> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryStore::new())
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!("using PostgreSQL storage");
            Arc::new(
                fleet_storage::PostgresStore::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL storage")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("PostgreSQL backend requested but feature 'postgres-backend' is not enabled");
        }
    };

    let controller: Arc<dyn ControllerAdapter> = Arc::new(FakeControllerAdapter::new());

    #[cfg(feature = "http-node-agent")]
    let node_agent: Arc<dyn NodeAgentClient> = Arc::new(fleet_core::adapters::HttpNodeAgentClient::new(
        StdDuration::from_secs(10),
    ));
    #[cfg(not(feature = "http-node-agent"))]
    let node_agent: Arc<dyn NodeAgentClient> = Arc::new(fleet_core::adapters::FakeNodeAgentClient::new());

    let heartbeat_interval = Duration::seconds(config.loop_interval.as_secs() as i64);
    let host_registry = Arc::new(HostRegistry::new(
        Arc::clone(&store),
        config.allow_unknown_host_registration,
        heartbeat_interval,
    ));

    let label_routes: HashMap<String, Vec<String>> = config
        .scaling
        .labels
        .iter()
        .map(|label| (label.clone(), Vec::new()))
        .collect();
    let placement: Arc<dyn fleet_core::placement::Placer> = Arc::new(Placement::new(MapRouter::new(label_routes)));

    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::clone(&node_agent),
        ProvisionerConfig {
            base_image_by_label: HashMap::new(),
            disk_gb: config.scaling.disk_gb,
            controller_url: config.scaling.controller_url.clone(),
        },
    ));

    let scaler = Arc::new(Scaler::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::clone(&host_registry),
        Arc::clone(&placement),
        Arc::clone(&provisioner),
        ScalerConfig {
            labels: config.scaling.labels.clone(),
            demand_by_label: HashMap::new(),
            global_max_vms: config.scaling.global_max_vms,
            label_max_inflight: config.scaling.label_max_inflight,
            label_burst: config.scaling.label_burst,
            connect_deadline: Duration::seconds(config.scaling.connect_deadline_sec),
            vm_ttl: Duration::seconds(config.scaling.vm_ttl_sec),
            cooldown: Duration::seconds(30),
        },
    ));

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::clone(&node_agent),
        ReconcilerConfig {
            boot_grace: Duration::seconds(config.scaling.connect_deadline_sec),
            disconnected_grace: Duration::seconds(config.scaling.disconnected_grace_sec),
            ..ReconcilerConfig::default()
        },
    ));

    let gc = Arc::new(Gc::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::clone(&node_agent),
        GcConfig::default(),
    ));

    let state = Arc::new(AppState {
        store,
        controller,
        node_agent,
        host_registry,
        placement,
        allow_unknown_host_registration: config.allow_unknown_host_registration,
    });

    Ok((state, scaler, reconciler, gc))
}

/// Build the Axum router with all routes and middleware.
fn build_router(state: Arc<AppState>) -> Router {
    // Node-agent inbound routes require the per-host token header.
    let host_routes = Router::new()
        .nest("/v1/hosts", routes::hosts::router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-fleet-host-token"),
        ]);

    Router::new()
        .merge(host_routes)
        .nest("/v1/leases", routes::leases::router())
        .nest("/metrics", routes::metrics::router())
        .nest("/ui", routes::ui::router())
        .route("/healthz", axum::routing::get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Apply production hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via FLEET_DISABLE_MLOCK — host tokens may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        warn_mlock_failure(&e);
    }
}

#[allow(clippy::print_stderr)]
fn warn_mlock_failure(e: &str) {
    eprintln!("WARNING: failed to lock memory: {e} (set FLEET_DISABLE_MLOCK=true for dev)");
}
