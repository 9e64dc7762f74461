//! In-process adapters. Used by tests and by the daemon's HTTP tests; they
//! mirror the guarantees of the Postgres tables (monotonic offsets, unique
//! snapshot offsets, monotonic checkpoint).

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use btn_config::Ruleset;
use btn_schemas::{BusMsg, Event, GlobalState, LoggedEvent};
use chrono::Utc;
use tokio::sync::broadcast;

use crate::ports::{EventLog, NotificationBus, RulesRepository, StateStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryEventLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LogInner {
    events: Vec<LoggedEvent>,
    committed: Option<i64>,
}

/// Offsets start at 0 and increase by one per append.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    inner: Mutex<LogInner>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Option<i64> {
        lock(&self.inner).committed
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        lock(&self.inner).events.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &Event) -> Result<i64> {
        let mut inner = lock(&self.inner);
        let offset = inner.events.len() as i64;
        inner.events.push(LoggedEvent::new(offset, event.clone()));
        Ok(offset)
    }

    async fn poll(&self, after_offset: i64, max: usize) -> Result<Vec<LoggedEvent>> {
        let inner = lock(&self.inner);
        Ok(inner
            .events
            .iter()
            .filter(|e| e.offset > after_offset)
            .take(max)
            .cloned()
            .collect())
    }

    async fn commit(&self, offset: i64) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.committed = Some(inner.committed.map_or(offset, |c| c.max(offset)));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    rows: Mutex<Vec<GlobalState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with one already-persisted snapshot.
    pub fn with(state: GlobalState) -> Self {
        let mut st = state;
        st.id = 1;
        st.created_at.get_or_insert_with(Utc::now);
        Self {
            rows: Mutex::new(vec![st]),
        }
    }

    /// Every snapshot in append order.
    pub fn snapshots(&self) -> Vec<GlobalState> {
        lock(&self.rows).clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn latest(&self) -> Result<Option<GlobalState>> {
        Ok(lock(&self.rows).last().cloned())
    }

    async fn append(&self, state: &GlobalState) -> Result<GlobalState> {
        let mut rows = lock(&self.rows);
        if rows
            .iter()
            .any(|r| r.last_applied_offset == state.last_applied_offset)
        {
            bail!(
                "snapshot for last_applied_offset={} already exists",
                state.last_applied_offset
            );
        }
        let mut stored = state.clone();
        stored.id = rows.last().map_or(1, |r| r.id + 1);
        stored.created_at = Some(Utc::now());
        rows.push(stored.clone());
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// MemoryRulesRepository
// ---------------------------------------------------------------------------

/// The most recently activated ruleset is current.
#[derive(Debug, Default)]
pub struct MemoryRulesRepository {
    rulesets: Mutex<Vec<Ruleset>>,
}

impl MemoryRulesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(ruleset: Ruleset) -> Self {
        Self {
            rulesets: Mutex::new(vec![ruleset]),
        }
    }

    pub fn activate(&self, ruleset: Ruleset) {
        let mut all = lock(&self.rulesets);
        all.retain(|r| r.hash != ruleset.hash);
        all.push(ruleset);
    }

    pub fn clear(&self) {
        lock(&self.rulesets).clear();
    }
}

#[async_trait]
impl RulesRepository for MemoryRulesRepository {
    async fn current_hash(&self) -> Result<Option<String>> {
        Ok(lock(&self.rulesets).last().map(|r| r.hash.clone()))
    }

    async fn fetch(&self, hash: &str) -> Result<Option<Ruleset>> {
        Ok(lock(&self.rulesets).iter().find(|r| r.hash == hash).cloned())
    }
}

// ---------------------------------------------------------------------------
// BroadcastBus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub msg: BusMsg,
}

/// tokio broadcast channel. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Published>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationBus for BroadcastBus {
    async fn publish(&self, topic: &str, state: &GlobalState) -> Result<()> {
        let _ = self.tx.send(Published {
            topic: topic.to_string(),
            msg: BusMsg::StateUpdated(state.clone()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btn_schemas::Phase;

    #[tokio::test]
    async fn log_poll_respects_after_and_max() {
        let log = MemoryEventLog::new();
        for i in 0..5 {
            assert_eq!(log.append(&Event::press(format!("r{i}"), i)).await.unwrap(), i);
        }
        let got = log.poll(1, 2).await.unwrap();
        let offsets: Vec<i64> = got.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[tokio::test]
    async fn log_commit_never_moves_back() {
        let log = MemoryEventLog::new();
        log.commit(7).await.unwrap();
        log.commit(3).await.unwrap();
        assert_eq!(log.committed(), Some(7));
    }

    #[tokio::test]
    async fn store_rejects_duplicate_offset() {
        let store = MemoryStateStore::new();
        let mut st = GlobalState::genesis("h");
        st.last_applied_offset = 4;
        let first = store.append(&st).await.unwrap();
        assert_eq!(first.id, 1);
        assert!(first.created_at.is_some());
        assert!(store.append(&st).await.is_err());

        st.last_applied_offset = 5;
        assert_eq!(store.append(&st).await.unwrap().id, 2);
        assert_eq!(store.latest().await.unwrap().unwrap().last_applied_offset, 5);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = BroadcastBus::new(4);
        let mut rx = bus.subscribe();
        let mut st = GlobalState::genesis("h");
        st.phase = Phase::Hot;
        bus.publish("state_updated", &st).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, "state_updated");
        assert_eq!(got.msg, BusMsg::StateUpdated(st));
    }

    #[tokio::test]
    async fn bus_without_subscribers_is_ok() {
        let bus = BroadcastBus::new(4);
        bus.publish("state_updated", &GlobalState::genesis("h"))
            .await
            .unwrap();
    }
}
