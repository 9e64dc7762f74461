//! Scenario: snapshot history stays monotonic through faults and restarts
//!
//! # Invariants under test
//!
//! Over a generated mix of presses, ticks, failed persists, lost commits
//! and reducer restarts:
//!
//! 1. Snapshot ids and `last_applied_offset` strictly increase.
//! 2. `counter` never decreases and `entropy` stays in [0, 1].
//! 3. Every press is applied exactly once: the final counter equals the
//!    number of presses appended.

use btn_runtime::{EventLog, StepOutcome};
use btn_schemas::{Event, GlobalState, Phase};
use btn_testkit::{ruleset, ReducerRig};
use proptest::collection;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Press,
    Tick,
    FailPersist,
    LoseCommit,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Press),
        1 => Just(Op::Tick),
        1 => Just(Op::FailPersist),
        1 => Just(Op::LoseCommit),
    ]
}

/// `(op, dt_ms, restart_reducer_before_step)`, always opening with a press so
/// the history ends with at least one snapshot.
fn history() -> impl Strategy<Value = Vec<(Op, i64, bool)>> {
    collection::vec((op(), 0i64..3_000, proptest::bool::weighted(0.06)), 0..150).prop_map(
        |mut ops| {
            ops.insert(0, (Op::Press, 0, false));
            ops
        },
    )
}

struct Outcome {
    snapshots: Vec<GlobalState>,
    presses: i64,
    last_offset: Option<i64>,
    committed: Option<i64>,
}

async fn drain(rig: &ReducerRig) -> anyhow::Result<()> {
    let mut reducer = rig.reducer();
    for _ in 0..50 {
        // Pending injected failures surface here; keep stepping past them.
        if let Ok(StepOutcome::Idle) = reducer.step().await {
            return Ok(());
        }
    }
    anyhow::bail!("reducer did not go idle");
}

async fn replay(ops: &[(Op, i64, bool)]) -> anyhow::Result<Outcome> {
    let rig = ReducerRig::new(ruleset());
    let mut reducer = rig.reducer();
    let mut presses = 0i64;
    let mut ts = 1_000i64;

    for (round, (op, dt, restart)) in ops.iter().enumerate() {
        ts += dt;
        match op {
            Op::Press => {
                rig.press(&format!("r{round}"), ts).await?;
                presses += 1;
            }
            Op::Tick => {
                let phase = rig
                    .store
                    .snapshots()
                    .last()
                    .map_or(Phase::Calm, |s| s.phase);
                rig.log.append(&Event::tick(ts, phase)).await?;
            }
            Op::FailPersist => rig.store.fail_next_appends(1),
            Op::LoseCommit => rig.log.fail_next_commits(1),
        }

        if *restart {
            reducer = rig.reducer();
        }
        let _ = reducer.step().await;
    }

    drain(&rig).await?;

    Ok(Outcome {
        snapshots: rig.store.snapshots(),
        presses,
        last_offset: rig.log.events().last().map(|e| e.offset),
        committed: rig.log.committed(),
    })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    #[test]
    fn history_is_monotonic_and_presses_apply_once(ops in history()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let out = rt.block_on(replay(&ops)).expect("replay");

        for w in out.snapshots.windows(2) {
            prop_assert!(w[0].id < w[1].id);
            prop_assert!(w[0].last_applied_offset < w[1].last_applied_offset);
            prop_assert!(w[0].counter <= w[1].counter);
        }
        prop_assert!(out.snapshots.iter().all(|s| (0.0..=1.0).contains(&s.entropy)));

        let last = out.snapshots.last().expect("at least one snapshot");
        prop_assert_eq!(last.counter, out.presses);
        prop_assert_eq!(Some(last.last_applied_offset), out.last_offset);
        prop_assert_eq!(out.committed, out.last_offset);
    }
}
