//! btn-rules
//!
//! The state-transition function for the global button state.
//!
//! - Presses add entropy, ticks only let it decay
//! - Phase is a step function of entropy (threshold = inclusive lower bound)
//! - A tick may lower the phase only once the cooldown of the current phase
//!   has elapsed; CALM is a floor
//! - A batch is one left fold in offset order and yields exactly one snapshot
//!
//! Pure deterministic logic. No IO, no wall-clock: every timestamp comes from
//! the events themselves.

mod engine;
mod types;

pub use engine::{
    apply_batch, apply_batch_with_report, apply_event, cooldown_for_phase, evaluate_event,
    phase_from_entropy, reveal_window_for_phase,
};
pub use types::*;
