//! Test doubles for the reducer/watcher pipeline.
//!
//! Wrappers over the in-memory adapters that fail on demand, plus a log that
//! behaves like a consumer-group transport: after a restart it redelivers
//! everything past the committed checkpoint, regardless of what the caller
//! asks for. Scenario tests under `tests/` drive `ReducerCore` and
//! `WatcherCore` through crash windows with these.

mod faults;
mod fixtures;

pub use faults::{BusFailure, FailingBus, FlakyStateStore, RedeliveringEventLog};
pub use fixtures::{fast_reducer_config, fast_watcher_config, ruleset, ruleset_with, ReducerRig};
