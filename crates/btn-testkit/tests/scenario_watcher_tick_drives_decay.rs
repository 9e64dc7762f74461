//! Scenario: the watcher forces decay to be observed
//!
//! # Invariants under test
//!
//! 1. The watcher appends nothing until the snapshot's cooldown has elapsed
//!    since `updated_at_ms`, and never writes a snapshot itself.
//! 2. Once the cooldown has elapsed its tick, folded by the reducer, lowers
//!    the phase without any press.
//! 3. A press that lands in the log before the tick wins: the tick's observed
//!    phase is stale by the time it is folded and it becomes a no-op.

use std::sync::Arc;

use btn_runtime::ports::ManualClock;
use btn_runtime::{StepOutcome, WatchOutcome};
use btn_schemas::Phase;
use btn_testkit::{ruleset, ReducerRig};

/// Six presses 1ms apart: entropy ~0.5995, HOT, updated_at_ms = 1005.
async fn heat_to_hot(rig: &ReducerRig) -> anyhow::Result<()> {
    for i in 0..6 {
        rig.press(&format!("heat-{i}"), 1_000 + i).await?;
    }
    let out = rig.reducer().step().await?;
    let StepOutcome::Applied { state, .. } = out else {
        panic!("expected Applied");
    };
    assert_eq!(state.phase, Phase::Hot);
    assert_eq!(state.updated_at_ms, 1_005);
    assert_eq!(state.cooldown_ms, 5_000);
    Ok(())
}

#[tokio::test]
async fn tick_after_cooldown_cools_the_state() -> anyhow::Result<()> {
    let rig = ReducerRig::new(ruleset());
    heat_to_hot(&rig).await?;

    let clock = Arc::new(ManualClock::new(3_000));
    let mut watcher = rig.watcher(clock.clone());
    assert_eq!(
        watcher.check_once().await?,
        WatchOutcome::CooldownPending { remaining_ms: 3_005 }
    );
    assert_eq!(rig.log.events().len(), 6);

    clock.set(6_005);
    assert_eq!(
        watcher.check_once().await?,
        WatchOutcome::Ticked {
            offset: 6,
            observed_phase: Phase::Hot
        }
    );
    assert_eq!(rig.store.snapshots().len(), 1, "watcher never writes state");

    let out = rig.reducer().step().await?;
    let StepOutcome::Applied { state, report, .. } = out else {
        panic!("expected Applied");
    };
    // 0.5995 - 0.0001 * 5000 = 0.0995
    assert_eq!(state.phase, Phase::Calm);
    assert!((state.entropy - 0.0995).abs() < 1e-9, "entropy={}", state.entropy);
    assert_eq!(state.counter, 6);
    assert_eq!(report.cooled_down, 1);

    clock.advance(60_000);
    assert_eq!(watcher.check_once().await?, WatchOutcome::Calm);
    Ok(())
}

#[tokio::test]
async fn press_ahead_of_tick_makes_tick_stale() -> anyhow::Result<()> {
    let rig = ReducerRig::new(ruleset());
    heat_to_hot(&rig).await?;

    // Presses reach the log first; the watcher still sees the HOT snapshot.
    rig.press("late-1", 6_000).await?;
    rig.press("late-2", 6_001).await?;

    let clock = Arc::new(ManualClock::new(6_005));
    let mut watcher = rig.watcher(clock);
    assert!(matches!(
        watcher.check_once().await?,
        WatchOutcome::Ticked {
            observed_phase: Phase::Hot,
            ..
        }
    ));

    let out = rig.reducer().step().await?;
    let StepOutcome::Applied { state, report, .. } = out else {
        panic!("expected Applied");
    };
    assert_eq!(report.pressed, 2);
    assert_eq!(report.stale_ticks, 1);
    assert_eq!(state.phase, Phase::Warm);
    assert_eq!(state.counter, 8);
    assert_eq!(state.updated_at_ms, 6_001, "stale tick does not touch the clock");
    assert_eq!(state.last_applied_offset, 8);
    Ok(())
}
