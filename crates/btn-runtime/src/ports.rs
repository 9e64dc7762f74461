//! Contracts with the collaborators the reducer and watcher depend on.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use btn_config::Ruleset;
use btn_schemas::{Event, GlobalState, LoggedEvent};

/// Append-only, totally ordered, single-partition log.
///
/// Redelivery of uncommitted offsets is expected: `poll` may hand back events
/// that were already folded into the latest snapshot.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event and return its offset.
    async fn append(&self, event: &Event) -> Result<i64>;

    /// Up to `max` events after `after_offset`, in offset order.
    async fn poll(&self, after_offset: i64, max: usize) -> Result<Vec<LoggedEvent>>;

    /// Mark everything up to and including `offset` as consumed.
    async fn commit(&self, offset: i64) -> Result<()>;
}

/// Append-only snapshot table. "Current" is the row with the highest id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn latest(&self) -> Result<Option<GlobalState>>;

    /// Append a snapshot; returns it as stored (with `id` and `created_at`).
    async fn append(&self, state: &GlobalState) -> Result<GlobalState>;
}

/// Best-effort pub/sub. Callers log and drop errors.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, topic: &str, state: &GlobalState) -> Result<()>;
}

#[async_trait]
pub trait RulesRepository: Send + Sync {
    /// Hash of the active ruleset, `None` when nothing has been seeded.
    async fn current_hash(&self) -> Result<Option<String>>;

    async fn fetch(&self, hash: &str) -> Result<Option<Ruleset>>;

    /// The active ruleset, resolved in one call.
    async fn current(&self) -> Result<Option<Ruleset>> {
        match self.current_hash().await? {
            Some(hash) => self.fetch(&hash).await,
            None => Ok(None),
        }
    }
}

/// Wall clock in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
