use btn_config::{RulesConfig, Ruleset};
use btn_schemas::{Event, GlobalState, LoggedEvent, Phase};

use crate::{BatchReport, EventOutcome};

/// Map entropy onto the phase ladder. Each threshold is the inclusive lower
/// bound of the next phase up.
pub fn phase_from_entropy(entropy: f64, thresholds: &[f64; 3]) -> Phase {
    if entropy >= thresholds[2] {
        Phase::Chaos
    } else if entropy >= thresholds[1] {
        Phase::Hot
    } else if entropy >= thresholds[0] {
        Phase::Warm
    } else {
        Phase::Calm
    }
}

/// Cooldown that must elapse before a state in `phase` may step down.
///
/// HOT and CHAOS share `cooldown_chaos_ms`; CALM has nothing below it.
pub fn cooldown_for_phase(phase: Phase, rules: &RulesConfig) -> i64 {
    match phase {
        Phase::Calm => 0,
        Phase::Warm => rules.cooldown_warm_ms,
        Phase::Hot | Phase::Chaos => rules.cooldown_chaos_ms,
    }
}

/// How long the button stays revealed after an event lands in `phase`.
pub fn reveal_window_for_phase(phase: Phase, rules: &RulesConfig) -> i64 {
    match phase {
        Phase::Calm => rules.reveal_calm_ms,
        Phase::Warm => rules.reveal_warm_ms,
        Phase::Hot => rules.reveal_hot_ms,
        Phase::Chaos => rules.reveal_chaos_ms,
    }
}

/// Apply one event and report what happened.
///
/// No-op outcomes return `state` unchanged (including `updated_at_ms`).
pub fn evaluate_event(
    state: &GlobalState,
    event: &Event,
    rules: &Ruleset,
) -> (GlobalState, EventOutcome) {
    let cfg = &rules.config;
    let ts = event.timestamp_ms();

    // Out-of-order timestamps never move time backward.
    let elapsed_ms = ts.saturating_sub(state.updated_at_ms).max(0);
    let decayed = (state.entropy - cfg.decay_rate * elapsed_ms as f64).max(0.0);

    let (entropy, counter, outcome) = match event {
        Event::Press { .. } => (
            (decayed + cfg.entropy_increment).min(1.0),
            state.counter + 1,
            EventOutcome::Pressed,
        ),
        Event::Tick { observed_phase, .. } => {
            if state.phase == Phase::Calm {
                return (state.clone(), EventOutcome::TickCalmFloor);
            }
            if *observed_phase != state.phase {
                return (
                    state.clone(),
                    EventOutcome::TickStale {
                        observed: *observed_phase,
                        actual: state.phase,
                    },
                );
            }

            let next_phase = phase_from_entropy(decayed, &cfg.thresholds);
            if next_phase < state.phase {
                let cooldown = cooldown_for_phase(state.phase, cfg);
                if elapsed_ms < cooldown {
                    return (
                        state.clone(),
                        EventOutcome::TickCooldownPending {
                            remaining_ms: cooldown - elapsed_ms,
                        },
                    );
                }
                (
                    decayed,
                    state.counter,
                    EventOutcome::CooledDown {
                        from: state.phase,
                        to: next_phase,
                    },
                )
            } else {
                (decayed, state.counter, EventOutcome::Decayed)
            }
        }
    };

    let entropy = entropy.clamp(0.0, 1.0);
    let phase = phase_from_entropy(entropy, &cfg.thresholds);
    let reveal_until_ms = state
        .reveal_until_ms
        .max(ts.saturating_add(reveal_window_for_phase(phase, cfg)));

    let next = GlobalState {
        counter,
        phase,
        entropy,
        reveal_until_ms,
        cooldown_ms: cooldown_for_phase(phase, cfg),
        updated_at_ms: ts,
        rules_hash: rules.hash.clone(),
        ..state.clone()
    };
    (next, outcome)
}

/// Apply one event.
pub fn apply_event(state: &GlobalState, event: &Event, rules: &Ruleset) -> GlobalState {
    evaluate_event(state, event, rules).0
}

/// Fold a batch into exactly one new snapshot.
///
/// Events are folded in ascending offset order regardless of input order. The
/// result carries the highest offset as `last_applied_offset` and is marked
/// unpersisted (`id == 0`, no `created_at`). `rules_hash` and `cooldown_ms`
/// always reflect `rules`, even when every event was a no-op;
/// `reveal_until_ms` is an absolute deadline and is left as folded. An empty
/// batch returns `state`.
pub fn apply_batch(state: &GlobalState, events: &[LoggedEvent], rules: &Ruleset) -> GlobalState {
    apply_batch_with_report(state, events, rules).0
}

pub fn apply_batch_with_report(
    state: &GlobalState,
    events: &[LoggedEvent],
    rules: &Ruleset,
) -> (GlobalState, BatchReport) {
    let mut report = BatchReport::default();
    if events.is_empty() {
        return (state.clone(), report);
    }

    let mut ordered: Vec<&LoggedEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.offset);

    let mut acc = state.clone();
    for logged in &ordered {
        let (next, outcome) = evaluate_event(&acc, &logged.event, rules);
        report.record(&outcome);
        acc = next;
    }

    let last_offset = ordered.last().map(|e| e.offset).unwrap_or(state.last_applied_offset);
    acc.last_applied_offset = last_offset;
    // No-op events keep the incoming fields; the snapshot must still read
    // consistently against the ruleset it is stamped with.
    acc.rules_hash = rules.hash.clone();
    acc.cooldown_ms = cooldown_for_phase(acc.phase, &rules.config);
    acc.id = 0;
    acc.created_at = None;
    (acc, report)
}
