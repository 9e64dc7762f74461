//! btn-runtime
//!
//! The I/O side of the button state pipeline.
//!
//! - [`ReducerCore`] drains the event log, folds batches through the rule
//!   engine, persists one snapshot per batch, commits the log checkpoint and
//!   then publishes best-effort.
//! - [`WatcherCore`] looks at the latest snapshot on an interval and appends a
//!   synthetic tick once the current phase's cooldown has elapsed. It never
//!   writes state.
//!
//! Both talk to the outside world only through the traits in [`ports`].
//! [`memory`] and [`pg`] provide in-process and Postgres implementations.

pub mod backoff;
pub mod memory;
pub mod pg;
pub mod ports;
mod reducer;
mod watcher;

use std::time::Duration;

use tokio::sync::watch;

pub use backoff::{Backoff, BackoffPolicy};
pub use ports::{Clock, EventLog, NotificationBus, RulesRepository, StateStore, SystemClock};
pub use reducer::{filter_unapplied, ReducerConfig, ReducerCore, ReducerError, StepOutcome};
pub use watcher::{WatchOutcome, WatcherConfig, WatcherCore};

/// Sleep for `d` unless shutdown is requested first.
///
/// Returns `true` when the loop should stop: the flag was set, or every
/// sender is gone.
pub async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
