//! btn-daemon entry point.
//!
//! Sets up tracing, reads `BTN_*` settings, hosts the reducer and/or watcher
//! (per `BTN_ROLE`) and serves the read-only HTTP API. Ctrl-C stops the
//! workers between iterations; a worker giving up ends the process with an
//! error so the orchestrator restarts it.

use std::sync::Arc;

use anyhow::{bail, Context};
use axum::http::{HeaderValue, Method};
use btn_config::ServiceSettings;
use btn_daemon::{routes, state};
use btn_runtime::pg::{PgEventLog, PgNotifyBus, PgRulesRepository, PgStateStore};
use btn_runtime::{ReducerConfig, SystemClock, WatcherConfig};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = ServiceSettings::from_env()?;
    let pool = btn_db::connect(&settings.database_url).await?;
    if !btn_db::status(&pool).await?.has_global_states_table {
        bail!("schema missing; run `btn db migrate` first");
    }

    let pipeline = state::Pipeline {
        log: Arc::new(PgEventLog::new(pool.clone(), settings.consumer_group.clone())),
        store: Arc::new(PgStateStore::new(pool.clone())),
        bus: Arc::new(PgNotifyBus::new(pool.clone())),
        rules: Arc::new(PgRulesRepository::new(pool.clone())),
        clock: Arc::new(SystemClock),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: JoinSet<anyhow::Result<()>> = JoinSet::new();
    if settings.role.runs_reducer() {
        state::spawn_reducer(
            &mut workers,
            &pipeline,
            ReducerConfig::from_settings(&settings),
            shutdown_rx.clone(),
        );
    }
    if settings.role.runs_watcher() {
        state::spawn_watcher(
            &mut workers,
            &pipeline,
            WatcherConfig::from_settings(&settings),
            shutdown_rx.clone(),
        );
    }
    info!(role = settings.role.as_str(), "workers started");

    let shared = Arc::new(state::AppState::new(pipeline.store.clone()));
    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let listener = tokio::net::TcpListener::bind(settings.daemon_addr)
        .await
        .with_context(|| format!("bind {}", settings.daemon_addr))?;
    info!("btn-daemon listening on http://{}", settings.daemon_addr);

    let mut server_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            })
            .await
            .context("server crashed")
    });

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received; shutting down");
            Ok(())
        }
        Some(joined) = workers.join_next() => {
            let res = joined.context("worker panicked").and_then(|r| r);
            if let Err(err) = &res {
                error!(error = %format!("{err:#}"), "worker exited; shutting down");
            }
            res
        }
    };

    let _ = shutdown_tx.send(true);
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined.context("worker panicked").and_then(|r| r) {
            error!(error = %format!("{err:#}"), "worker failed during shutdown");
        }
    }
    server.await.context("server task panicked")??;

    outcome
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: browsers on localhost may read state.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
}
