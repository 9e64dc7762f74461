use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use btn_runtime::memory::{MemoryEventLog, MemoryStateStore};
use btn_runtime::{EventLog, NotificationBus, StateStore};
use btn_schemas::{Event, GlobalState, LoggedEvent};

/// Decrement `n` if positive; `true` means "fail this call".
fn take_failure(n: &AtomicU32) -> bool {
    n.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// FlakyStateStore
// ---------------------------------------------------------------------------

/// [`MemoryStateStore`] whose next N reads or appends fail.
#[derive(Debug, Default)]
pub struct FlakyStateStore {
    inner: MemoryStateStore,
    fail_latest: AtomicU32,
    fail_appends: AtomicU32,
    append_attempts: AtomicUsize,
}

impl FlakyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_latest(&self, n: u32) {
        self.fail_latest.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn append_attempts(&self) -> usize {
        self.append_attempts.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> Vec<GlobalState> {
        self.inner.snapshots()
    }
}

#[async_trait]
impl StateStore for FlakyStateStore {
    async fn latest(&self) -> Result<Option<GlobalState>> {
        if take_failure(&self.fail_latest) {
            bail!("state store unreachable (injected)");
        }
        self.inner.latest().await
    }

    async fn append(&self, state: &GlobalState) -> Result<GlobalState> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_appends) {
            bail!("state store write failed (injected)");
        }
        self.inner.append(state).await
    }
}

// ---------------------------------------------------------------------------
// RedeliveringEventLog
// ---------------------------------------------------------------------------

/// Consumer-group style log: `poll` ignores `after_offset` and resumes right
/// after the committed checkpoint, so anything persisted but not committed is
/// handed back again.
#[derive(Debug, Default)]
pub struct RedeliveringEventLog {
    inner: MemoryEventLog,
    fail_commits: AtomicU32,
    polls: AtomicUsize,
}

impl RedeliveringEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail, as if the process died right after
    /// persisting.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    pub fn committed(&self) -> Option<i64> {
        self.inner.committed()
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.inner.events()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventLog for RedeliveringEventLog {
    async fn append(&self, event: &Event) -> Result<i64> {
        self.inner.append(event).await
    }

    async fn poll(&self, _after_offset: i64, max: usize) -> Result<Vec<LoggedEvent>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let resume_after = self.inner.committed().unwrap_or(-1);
        self.inner.poll(resume_after, max).await
    }

    async fn commit(&self, offset: i64) -> Result<()> {
        if take_failure(&self.fail_commits) {
            bail!("checkpoint commit lost (injected)");
        }
        self.inner.commit(offset).await
    }
}

// ---------------------------------------------------------------------------
// FailingBus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFailure {
    /// Every publish returns an error.
    Error,
    /// Every publish hangs forever.
    Hang,
}

#[derive(Debug)]
pub struct FailingBus {
    mode: BusFailure,
    calls: AtomicUsize,
}

impl FailingBus {
    pub fn new(mode: BusFailure) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationBus for FailingBus {
    async fn publish(&self, topic: &str, _state: &GlobalState) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            BusFailure::Error => bail!("bus unavailable on {topic} (injected)"),
            BusFailure::Hang => std::future::pending().await,
        }
    }
}
