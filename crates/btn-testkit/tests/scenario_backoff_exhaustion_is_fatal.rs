//! Scenario: transient failures back off, persistent ones are fatal
//!
//! # Invariants under test
//!
//! 1. A failure streak shorter than the attempt budget is retried and the
//!    loop recovers on its own.
//! 2. One failure past the budget ends `run` with `RetriesExhausted`.
//! 3. A missing ruleset is handled the same way and surfaces as the cause.

use std::time::Duration;

use btn_runtime::ReducerError;
use btn_testkit::{ruleset, ReducerRig};
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn short_failure_streak_recovers() -> anyhow::Result<()> {
    let rig = ReducerRig::new(ruleset());
    rig.press("a", 1_000).await?;
    rig.store.fail_next_latest(3);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(rig.reducer().run(rx));

    for _ in 0..200 {
        if !rig.store.snapshots().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let snapshots = rig.store.snapshots();
    assert_eq!(snapshots.len(), 1, "reducer recovers after 3 failures");
    assert_eq!(snapshots[0].counter, 1);

    tx.send(true)?;
    handle.await?.expect("clean shutdown");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_past_budget_is_fatal() -> anyhow::Result<()> {
    let rig = ReducerRig::new(ruleset());
    rig.store.fail_next_latest(u32::MAX);

    let (_tx, rx) = watch::channel(false);
    let err = rig.reducer().run(rx).await.unwrap_err();
    match err {
        ReducerError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4, "max_attempts=3, the 4th failure is fatal");
            assert!(format!("{last:#}").contains("injected"));
        }
        other => panic!("expected RetriesExhausted, got {other}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_ruleset_is_fatal() -> anyhow::Result<()> {
    let rig = ReducerRig::new(ruleset());
    rig.rules.clear();
    rig.press("a", 1_000).await?;

    let (_tx, rx) = watch::channel(false);
    let err = rig.reducer().run(rx).await.unwrap_err();
    let ReducerError::RetriesExhausted { last, .. } = err else {
        panic!("expected RetriesExhausted");
    };
    assert!(matches!(
        last.downcast_ref::<ReducerError>(),
        Some(ReducerError::RulesUnavailable { hash: None })
    ));
    assert!(rig.store.snapshots().is_empty());
    assert_eq!(rig.log.committed(), None);
    Ok(())
}
