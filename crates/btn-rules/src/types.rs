use btn_schemas::Phase;

/// Why an event did or did not change the state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// A press was applied.
    Pressed,
    /// A tick applied decay without lowering the phase.
    Decayed,
    /// A tick applied decay and the phase moved down.
    CooledDown { from: Phase, to: Phase },
    /// A tick would lower the phase but the cooldown has not elapsed.
    TickCooldownPending { remaining_ms: i64 },
    /// The tick's observed phase no longer matches the state it lands on.
    TickStale { observed: Phase, actual: Phase },
    /// Ticks never change a CALM state.
    TickCalmFloor,
}

impl EventOutcome {
    /// `true` when the event left the state untouched.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            EventOutcome::TickCooldownPending { .. }
                | EventOutcome::TickStale { .. }
                | EventOutcome::TickCalmFloor
        )
    }
}

/// Per-batch tally of [`EventOutcome`]s, used for logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    pub pressed: usize,
    pub decayed: usize,
    pub cooled_down: usize,
    pub cooldown_pending: usize,
    pub stale_ticks: usize,
    pub calm_floor: usize,
}

impl BatchReport {
    pub fn record(&mut self, outcome: &EventOutcome) {
        self.events += 1;
        match outcome {
            EventOutcome::Pressed => self.pressed += 1,
            EventOutcome::Decayed => self.decayed += 1,
            EventOutcome::CooledDown { .. } => self.cooled_down += 1,
            EventOutcome::TickCooldownPending { .. } => self.cooldown_pending += 1,
            EventOutcome::TickStale { .. } => self.stale_ticks += 1,
            EventOutcome::TickCalmFloor => self.calm_floor += 1,
        }
    }

    pub fn ticks_rejected(&self) -> usize {
        self.cooldown_pending + self.stale_ticks + self.calm_floor
    }
}
