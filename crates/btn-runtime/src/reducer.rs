use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use btn_config::{Ruleset, ServiceSettings};
use btn_rules::{apply_batch_with_report, BatchReport};
use btn_schemas::{GlobalState, LoggedEvent, STATE_UPDATED_TOPIC};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::ports::{EventLog, NotificationBus, RulesRepository, StateStore};
use crate::sleep_or_shutdown;

#[derive(Debug, Clone)]
pub struct ReducerConfig {
    pub batch_size: usize,
    /// Wait between polls that return nothing.
    pub idle_poll: Duration,
    pub publish_timeout: Duration,
    pub topic: String,
    pub backoff: BackoffPolicy,
}

impl ReducerConfig {
    pub fn from_settings(s: &ServiceSettings) -> Self {
        Self {
            batch_size: s.batch_size,
            idle_poll: s.idle_poll,
            publish_timeout: s.publish_timeout,
            topic: s.notify_channel.clone(),
            backoff: BackoffPolicy::from_settings(s),
        }
    }
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_poll: Duration::from_millis(250),
            publish_timeout: Duration::from_secs(2),
            topic: STATE_UPDATED_TOPIC.to_string(),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3),
        }
    }
}

#[derive(Debug)]
pub enum ReducerError {
    /// No active ruleset, or the active hash cannot be fetched.
    RulesUnavailable { hash: Option<String> },
    /// Consecutive failures exceeded the backoff budget.
    RetriesExhausted { attempts: u32, last: anyhow::Error },
}

impl fmt::Display for ReducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReducerError::RulesUnavailable { hash: None } => {
                write!(f, "RULES_UNAVAILABLE: no active ruleset")
            }
            ReducerError::RulesUnavailable { hash: Some(h) } => {
                write!(f, "RULES_UNAVAILABLE: active ruleset {h} not found")
            }
            ReducerError::RetriesExhausted { attempts, last } => {
                write!(f, "RETRIES_EXHAUSTED after {attempts} attempts: {last:#}")
            }
        }
    }
}

impl std::error::Error for ReducerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReducerError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            ReducerError::RulesUnavailable { .. } => None,
        }
    }
}

/// What one reducer iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The log had nothing after the latest snapshot.
    Idle,
    /// Everything polled was already applied; the checkpoint was re-committed.
    CaughtUp { committed_offset: i64 },
    /// A batch was folded, persisted and committed.
    Applied {
        state: GlobalState,
        report: BatchReport,
        published: bool,
    },
}

/// Drop events already reflected in a snapshot at `last_applied_offset`.
pub fn filter_unapplied(events: Vec<LoggedEvent>, last_applied_offset: i64) -> Vec<LoggedEvent> {
    events
        .into_iter()
        .filter(|e| e.offset > last_applied_offset)
        .collect()
}

/// Single consumer of the event log and sole writer of snapshots.
pub struct ReducerCore {
    log: Arc<dyn EventLog>,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn NotificationBus>,
    rules: Arc<dyn RulesRepository>,
    cfg: ReducerConfig,
    active_rules: Option<Ruleset>,
}

impl ReducerCore {
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn NotificationBus>,
        rules: Arc<dyn RulesRepository>,
        cfg: ReducerConfig,
    ) -> Self {
        Self {
            log,
            store,
            bus,
            rules,
            cfg,
            active_rules: None,
        }
    }

    pub fn active_rules_hash(&self) -> Option<&str> {
        self.active_rules.as_ref().map(|r| r.hash.as_str())
    }

    /// One consume -> fold -> persist -> commit -> notify pass.
    ///
    /// The latest snapshot is re-read every time; nothing carries over in
    /// memory except the ruleset cache.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let latest = self
            .store
            .latest()
            .await
            .context("read latest snapshot")?;
        let applied = latest.as_ref().map_or(-1, |s| s.last_applied_offset);

        let polled = self
            .log
            .poll(applied, self.cfg.batch_size)
            .await
            .context("poll event log")?;
        if polled.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let polled_len = polled.len();
        let batch = filter_unapplied(polled, applied);
        if batch.is_empty() {
            // Redelivery after a crash between persist and commit.
            self.log
                .commit(applied)
                .await
                .context("re-commit checkpoint")?;
            debug!(
                last_applied_offset = applied,
                redelivered = polled_len,
                "redelivered batch already applied"
            );
            return Ok(StepOutcome::CaughtUp {
                committed_offset: applied,
            });
        }

        let rules = self.resolve_rules().await?;
        let base = latest.unwrap_or_else(|| GlobalState::genesis(rules.hash.clone()));
        let (next, report) = apply_batch_with_report(&base, &batch, &rules);

        let stored = self
            .store
            .append(&next)
            .await
            .with_context(|| format!("persist snapshot at offset {}", next.last_applied_offset))?;

        self.log
            .commit(stored.last_applied_offset)
            .await
            .with_context(|| format!("commit checkpoint {}", stored.last_applied_offset))?;

        info!(
            state_id = stored.id,
            offset = stored.last_applied_offset,
            counter = stored.counter,
            phase = %stored.phase,
            entropy = stored.entropy,
            events = report.events,
            pressed = report.pressed,
            ticks_rejected = report.ticks_rejected(),
            rules_hash = %stored.rules_hash,
            "snapshot persisted"
        );

        let published = self.publish(&stored).await;
        Ok(StepOutcome::Applied {
            state: stored,
            report,
            published,
        })
    }

    /// Run until shutdown is signalled or retries are exhausted.
    ///
    /// Shutdown is only observed between iterations, so an in-flight persist
    /// always completes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReducerError> {
        let mut backoff = Backoff::new(self.cfg.backoff.clone());
        info!(
            batch_size = self.cfg.batch_size,
            topic = %self.cfg.topic,
            "reducer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.step().await {
                Ok(StepOutcome::Idle) => {
                    backoff.reset();
                    if sleep_or_shutdown(self.cfg.idle_poll, &mut shutdown).await {
                        break;
                    }
                }
                Ok(_) => backoff.reset(),
                Err(err) => match backoff.on_failure() {
                    Some(delay) => {
                        warn!(
                            attempt = backoff.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %format!("{err:#}"),
                            "reducer iteration failed; backing off"
                        );
                        if sleep_or_shutdown(delay, &mut shutdown).await {
                            break;
                        }
                    }
                    None => {
                        error!(
                            attempts = backoff.failures(),
                            error = %format!("{err:#}"),
                            "reducer reached max attempts; giving up"
                        );
                        return Err(ReducerError::RetriesExhausted {
                            attempts: backoff.failures(),
                            last: err,
                        });
                    }
                },
            }
        }

        info!("reducer stopped");
        Ok(())
    }

    async fn resolve_rules(&mut self) -> Result<Ruleset> {
        let hash = self
            .rules
            .current_hash()
            .await
            .context("resolve active rules hash")?
            .ok_or(ReducerError::RulesUnavailable { hash: None })?;

        if let Some(active) = &self.active_rules {
            if active.hash == hash {
                return Ok(active.clone());
            }
        }

        let ruleset = self
            .rules
            .fetch(&hash)
            .await
            .with_context(|| format!("fetch ruleset {hash}"))?
            .ok_or_else(|| ReducerError::RulesUnavailable {
                hash: Some(hash.clone()),
            })?;

        info!(
            rules_hash = %ruleset.hash,
            previous = ?self.active_rules_hash(),
            "ruleset loaded"
        );
        self.active_rules = Some(ruleset.clone());
        Ok(ruleset)
    }

    async fn publish(&self, state: &GlobalState) -> bool {
        let sent = tokio::time::timeout(
            self.cfg.publish_timeout,
            self.bus.publish(&self.cfg.topic, state),
        )
        .await;

        match sent {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(
                    state_id = state.id,
                    error = %format!("{err:#}"),
                    "publish failed; continuing"
                );
                false
            }
            Err(_) => {
                warn!(
                    state_id = state.id,
                    timeout_ms = self.cfg.publish_timeout.as_millis() as u64,
                    "publish timed out; continuing"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BroadcastBus, MemoryEventLog, MemoryRulesRepository, MemoryStateStore};
    use btn_config::RulesConfig;
    use btn_schemas::{Event, Phase};

    fn ruleset() -> Ruleset {
        Ruleset::new(
            "rules-a",
            RulesConfig {
                entropy_increment: 0.1,
                decay_rate: 0.0,
                thresholds: [0.2, 0.5, 0.8],
                cooldown_warm_ms: 3_000,
                cooldown_chaos_ms: 5_000,
                reveal_calm_ms: 0,
                reveal_warm_ms: 0,
                reveal_hot_ms: 0,
                reveal_chaos_ms: 0,
            },
        )
    }

    struct Harness {
        log: Arc<MemoryEventLog>,
        store: Arc<MemoryStateStore>,
        rules: Arc<MemoryRulesRepository>,
        reducer: ReducerCore,
    }

    fn harness() -> Harness {
        let log = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryStateStore::new());
        let rules = Arc::new(MemoryRulesRepository::with(ruleset()));
        let bus = Arc::new(BroadcastBus::new(16));
        let reducer = ReducerCore::new(
            log.clone(),
            store.clone(),
            bus,
            rules.clone(),
            ReducerConfig::default(),
        );
        Harness {
            log,
            store,
            rules,
            reducer,
        }
    }

    #[test]
    fn filter_drops_offsets_at_or_below_checkpoint() {
        let events = vec![
            LoggedEvent::new(4, Event::press("a", 1)),
            LoggedEvent::new(5, Event::press("b", 2)),
            LoggedEvent::new(6, Event::press("c", 3)),
        ];
        let kept = filter_unapplied(events, 5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].offset, 6);
    }

    #[tokio::test]
    async fn empty_log_is_idle_and_writes_nothing() {
        let mut h = harness();
        assert_eq!(h.reducer.step().await.unwrap(), StepOutcome::Idle);
        assert!(h.store.snapshots().is_empty());
        assert_eq!(h.log.committed(), None);
    }

    #[tokio::test]
    async fn first_batch_folds_onto_genesis() {
        let mut h = harness();
        h.log.append(&Event::press("a", 1_000)).await.unwrap();
        h.log.append(&Event::press("b", 1_010)).await.unwrap();

        let (state, report) = match h.reducer.step().await.unwrap() {
            StepOutcome::Applied { state, report, .. } => (state, report),
            other => panic!("expected Applied, got {other:?}"),
        };
        assert_eq!(state.id, 1);
        assert_eq!(state.counter, 2);
        assert_eq!(state.last_applied_offset, 1);
        assert_eq!(state.rules_hash, "rules-a");
        assert_eq!(report.pressed, 2);
        assert_eq!(h.log.committed(), Some(1));
        assert_eq!(h.reducer.active_rules_hash(), Some("rules-a"));
    }

    #[tokio::test]
    async fn batch_size_bounds_each_snapshot() {
        let mut h = harness();
        h.reducer.cfg.batch_size = 2;
        for i in 0..5 {
            h.log.append(&Event::press(format!("r{i}"), 1_000 + i)).await.unwrap();
        }

        for _ in 0..3 {
            h.reducer.step().await.unwrap();
        }
        let offsets: Vec<i64> = h
            .store
            .snapshots()
            .iter()
            .map(|s| s.last_applied_offset)
            .collect();
        assert_eq!(offsets, vec![1, 3, 4]);
        assert_eq!(h.reducer.step().await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn missing_ruleset_fails_without_persisting() {
        let mut h = harness();
        h.rules.clear();
        h.log.append(&Event::press("a", 1_000)).await.unwrap();

        let err = h.reducer.step().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReducerError>(),
            Some(ReducerError::RulesUnavailable { hash: None })
        ));
        assert!(h.store.snapshots().is_empty());
        assert_eq!(h.log.committed(), None);
    }

    #[tokio::test]
    async fn tick_on_calm_still_advances_offset() {
        let mut h = harness();
        h.log.append(&Event::tick(5_000, Phase::Calm)).await.unwrap();

        let (state, report) = match h.reducer.step().await.unwrap() {
            StepOutcome::Applied { state, report, .. } => (state, report),
            other => panic!("expected Applied, got {other:?}"),
        };
        assert_eq!(state.last_applied_offset, 0);
        assert_eq!(state.counter, 0);
        assert_eq!(state.updated_at_ms, 0);
        assert_eq!(report.calm_floor, 1);
    }

    #[test]
    fn error_display_is_prefixed() {
        let e = ReducerError::RulesUnavailable {
            hash: Some("abc".into()),
        };
        assert_eq!(e.to_string(), "RULES_UNAVAILABLE: active ruleset abc not found");
    }
}
