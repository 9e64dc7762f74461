use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use btn_config::ServiceSettings;
use btn_schemas::{Event, GlobalState, Phase};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::ports::{Clock, EventLog, StateStore};
use crate::sleep_or_shutdown;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval: Duration,
    pub backoff: BackoffPolicy,
}

impl WatcherConfig {
    pub fn from_settings(s: &ServiceSettings) -> Self {
        Self {
            interval: s.watcher_interval,
            backoff: BackoffPolicy::from_settings(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Nothing has been persisted yet.
    NoState,
    /// CALM has no further down-transition.
    Calm,
    CooldownPending { remaining_ms: i64 },
    /// A tick was already sent for this cooldown window; `state_id` is the
    /// snapshot currently observed.
    AlreadyTicked { state_id: i64 },
    Ticked { offset: i64, observed_phase: Phase },
}

/// Identifies one cooldown window. A rejected tick persists a new snapshot id
/// but leaves all three fields as they were, so it does not open a new window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CooldownWindow {
    updated_at_ms: i64,
    phase: Phase,
    cooldown_ms: i64,
}

impl CooldownWindow {
    fn of(state: &GlobalState) -> Self {
        Self {
            updated_at_ms: state.updated_at_ms,
            phase: state.phase,
            cooldown_ms: state.cooldown_ms,
        }
    }
}

/// Periodic decay trigger. Reads snapshots, appends ticks, never writes state.
pub struct WatcherCore {
    store: Arc<dyn StateStore>,
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    cfg: WatcherConfig,
    last_ticked: Option<CooldownWindow>,
}

impl WatcherCore {
    pub fn new(
        store: Arc<dyn StateStore>,
        log: Arc<dyn EventLog>,
        clock: Arc<dyn Clock>,
        cfg: WatcherConfig,
    ) -> Self {
        Self {
            store,
            log,
            clock,
            cfg,
            last_ticked: None,
        }
    }

    pub async fn check_once(&mut self) -> Result<WatchOutcome> {
        let Some(state) = self
            .store
            .latest()
            .await
            .context("watcher: read latest snapshot")?
        else {
            return Ok(WatchOutcome::NoState);
        };

        if state.phase == Phase::Calm {
            return Ok(WatchOutcome::Calm);
        }

        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(state.updated_at_ms).max(0);
        if elapsed < state.cooldown_ms {
            return Ok(WatchOutcome::CooldownPending {
                remaining_ms: state.cooldown_ms - elapsed,
            });
        }

        let window = CooldownWindow::of(&state);
        if self.last_ticked == Some(window) {
            return Ok(WatchOutcome::AlreadyTicked { state_id: state.id });
        }

        let offset = self
            .log
            .append(&Event::tick(now, state.phase))
            .await
            .context("watcher: append tick")?;
        self.last_ticked = Some(window);

        info!(
            offset,
            state_id = state.id,
            phase = %state.phase,
            elapsed_ms = elapsed,
            "tick appended"
        );
        Ok(WatchOutcome::Ticked {
            offset,
            observed_phase: state.phase,
        })
    }

    /// Check every `interval` until shutdown. Consecutive failures beyond the
    /// backoff budget end the loop with an error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = Backoff::new(self.cfg.backoff.clone());
        info!(
            interval_ms = self.cfg.interval.as_millis() as u64,
            "watcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.check_once().await {
                Ok(outcome) => {
                    backoff.reset();
                    debug!(?outcome, "watcher check");
                    self.cfg.interval
                }
                Err(err) => match backoff.on_failure() {
                    Some(delay) => {
                        warn!(
                            attempt = backoff.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %format!("{err:#}"),
                            "watcher check failed; backing off"
                        );
                        delay
                    }
                    None => {
                        error!(
                            attempts = backoff.failures(),
                            error = %format!("{err:#}"),
                            "watcher reached max attempts; giving up"
                        );
                        return Err(err.context(format!(
                            "watcher gave up after {} consecutive failures",
                            backoff.failures()
                        )));
                    }
                },
            };

            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }

        info!("watcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEventLog, MemoryStateStore};
    use crate::ports::ManualClock;

    fn hot_state() -> GlobalState {
        let mut st = GlobalState::genesis("h");
        st.phase = Phase::Hot;
        st.entropy = 0.55;
        st.cooldown_ms = 5_000;
        st.updated_at_ms = 1_000;
        st.last_applied_offset = 9;
        st
    }

    fn watcher(
        store: Arc<MemoryStateStore>,
        log: Arc<MemoryEventLog>,
        clock: Arc<ManualClock>,
    ) -> WatcherCore {
        WatcherCore::new(
            store,
            log,
            clock,
            WatcherConfig {
                interval: Duration::from_millis(10),
                backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 2),
            },
        )
    }

    #[tokio::test]
    async fn no_state_no_tick() {
        let log = Arc::new(MemoryEventLog::new());
        let mut w = watcher(
            Arc::new(MemoryStateStore::new()),
            log.clone(),
            Arc::new(ManualClock::new(10_000)),
        );
        assert_eq!(w.check_once().await.unwrap(), WatchOutcome::NoState);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn calm_state_no_tick() {
        let log = Arc::new(MemoryEventLog::new());
        let mut st = hot_state();
        st.phase = Phase::Calm;
        let mut w = watcher(
            Arc::new(MemoryStateStore::with(st)),
            log.clone(),
            Arc::new(ManualClock::new(1_000_000)),
        );
        assert_eq!(w.check_once().await.unwrap(), WatchOutcome::Calm);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn waits_for_cooldown_then_ticks_once_per_snapshot() {
        let log = Arc::new(MemoryEventLog::new());
        let clock = Arc::new(ManualClock::new(4_000));
        let mut w = watcher(
            Arc::new(MemoryStateStore::with(hot_state())),
            log.clone(),
            clock.clone(),
        );

        assert_eq!(
            w.check_once().await.unwrap(),
            WatchOutcome::CooldownPending { remaining_ms: 2_000 }
        );

        clock.set(6_000);
        assert_eq!(
            w.check_once().await.unwrap(),
            WatchOutcome::Ticked {
                offset: 0,
                observed_phase: Phase::Hot
            }
        );
        assert_eq!(log.events()[0].event, Event::tick(6_000, Phase::Hot));

        clock.set(9_000);
        assert_eq!(
            w.check_once().await.unwrap(),
            WatchOutcome::AlreadyTicked { state_id: 1 }
        );
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn rejected_tick_snapshot_does_not_reopen_window() {
        let log = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryStateStore::with(hot_state()));
        let clock = Arc::new(ManualClock::new(6_000));
        let mut w = watcher(store.clone(), log.clone(), clock.clone());

        assert!(matches!(w.check_once().await.unwrap(), WatchOutcome::Ticked { .. }));

        // The reducer rejected the tick: new row, same window.
        let mut same = hot_state();
        same.last_applied_offset = 10;
        store.append(&same).await.unwrap();
        clock.set(6_010);
        assert_eq!(
            w.check_once().await.unwrap(),
            WatchOutcome::AlreadyTicked { state_id: 2 }
        );
        assert_eq!(log.len(), 1);

        // A longer cooldown restamped by new rules is a new window.
        let mut longer = hot_state();
        longer.last_applied_offset = 11;
        longer.cooldown_ms = 60_000;
        store.append(&longer).await.unwrap();
        assert_eq!(
            w.check_once().await.unwrap(),
            WatchOutcome::CooldownPending { remaining_ms: 54_990 }
        );
        clock.set(61_000);
        assert!(matches!(w.check_once().await.unwrap(), WatchOutcome::Ticked { .. }));
        assert_eq!(log.len(), 2);
    }
}
