//! Shared runtime state for btn-daemon plus the background workers it hosts.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The reducer and watcher
//! run as tasks in a `JoinSet`; either one returning is treated as the end of
//! the process by `main.rs`.

use std::sync::Arc;

use anyhow::Context;
use btn_runtime::{
    Clock, EventLog, NotificationBus, ReducerConfig, ReducerCore, RulesRepository, StateStore,
    WatcherConfig, WatcherCore,
};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    /// Read-only view of the snapshot table.
    pub store: Arc<dyn StateStore>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            build: BuildInfo {
                service: "btn-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

/// Seconds since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Collaborators the workers are wired to.
#[derive(Clone)]
pub struct Pipeline {
    pub log: Arc<dyn EventLog>,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn NotificationBus>,
    pub rules: Arc<dyn RulesRepository>,
    pub clock: Arc<dyn Clock>,
}

pub fn spawn_reducer(
    workers: &mut JoinSet<anyhow::Result<()>>,
    p: &Pipeline,
    cfg: ReducerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let reducer = ReducerCore::new(
        p.log.clone(),
        p.store.clone(),
        p.bus.clone(),
        p.rules.clone(),
        cfg,
    );
    workers.spawn(async move { reducer.run(shutdown).await.context("reducer stopped") });
}

pub fn spawn_watcher(
    workers: &mut JoinSet<anyhow::Result<()>>,
    p: &Pipeline,
    cfg: WatcherConfig,
    shutdown: watch::Receiver<bool>,
) {
    let watcher = WatcherCore::new(p.store.clone(), p.log.clone(), p.clock.clone(), cfg);
    workers.spawn(async move { watcher.run(shutdown).await });
}
