use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use btn_config::{RulesConfig, Ruleset};
use btn_runtime::memory::{BroadcastBus, MemoryRulesRepository};
use btn_runtime::{
    BackoffPolicy, Clock, EventLog, NotificationBus, ReducerConfig, ReducerCore, StateStore,
    WatcherConfig, WatcherCore,
};
use btn_schemas::{Event, GlobalState, STATE_UPDATED_TOPIC};

use crate::faults::{FlakyStateStore, RedeliveringEventLog};

/// Thresholds [0.2, 0.5, 0.8], +0.1 per press, 0.0001/ms decay,
/// 3s WARM cooldown, 5s HOT/CHAOS cooldown.
pub fn ruleset() -> Ruleset {
    ruleset_with("rules-test-v1", 0.0001)
}

pub fn ruleset_with(hash: &str, decay_rate: f64) -> Ruleset {
    Ruleset::new(
        hash,
        RulesConfig {
            entropy_increment: 0.1,
            decay_rate,
            thresholds: [0.2, 0.5, 0.8],
            cooldown_warm_ms: 3_000,
            cooldown_chaos_ms: 5_000,
            reveal_calm_ms: 0,
            reveal_warm_ms: 1_000,
            reveal_hot_ms: 2_000,
            reveal_chaos_ms: 4_000,
        },
    )
}

pub fn fast_reducer_config() -> ReducerConfig {
    ReducerConfig {
        batch_size: 100,
        idle_poll: Duration::from_millis(5),
        publish_timeout: Duration::from_millis(50),
        topic: STATE_UPDATED_TOPIC.to_string(),
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(8), 3),
    }
}

pub fn fast_watcher_config() -> WatcherConfig {
    WatcherConfig {
        interval: Duration::from_millis(10),
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(8), 3),
    }
}

/// One log, one store, one rules repository. Each `reducer()` call builds a
/// fresh core over them, which is what a process restart looks like.
pub struct ReducerRig {
    pub log: Arc<RedeliveringEventLog>,
    pub store: Arc<FlakyStateStore>,
    pub rules: Arc<MemoryRulesRepository>,
    pub bus: BroadcastBus,
}

impl ReducerRig {
    pub fn new(ruleset: Ruleset) -> Self {
        Self {
            log: Arc::new(RedeliveringEventLog::new()),
            store: Arc::new(FlakyStateStore::new()),
            rules: Arc::new(MemoryRulesRepository::with(ruleset)),
            bus: BroadcastBus::new(64),
        }
    }

    pub fn reducer(&self) -> ReducerCore {
        self.reducer_with(Arc::new(self.bus.clone()), fast_reducer_config())
    }

    pub fn reducer_with(&self, bus: Arc<dyn NotificationBus>, cfg: ReducerConfig) -> ReducerCore {
        ReducerCore::new(
            self.log.clone(),
            self.store.clone(),
            bus,
            self.rules.clone(),
            cfg,
        )
    }

    pub fn watcher(&self, clock: Arc<dyn Clock>) -> WatcherCore {
        WatcherCore::new(
            self.store.clone(),
            self.log.clone(),
            clock,
            fast_watcher_config(),
        )
    }

    pub async fn press(&self, request_id: &str, timestamp_ms: i64) -> Result<i64> {
        self.log.append(&Event::press(request_id, timestamp_ms)).await
    }

    pub async fn latest(&self) -> Result<Option<GlobalState>> {
        self.store.latest().await
    }
}
