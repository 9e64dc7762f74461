//! btn-schemas
//!
//! Shared wire and storage types for the button state pipeline.
//!
//! Field names on [`GlobalState`] are part of the external contract: the HTTP
//! and SSE layers relay persisted snapshots verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic on which the reducer announces freshly persisted snapshots.
pub const STATE_UPDATED_TOPIC: &str = "state_updated";

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Position on the phase ladder. Ordering follows the ladder:
/// `Calm < Warm < Hot < Chaos`.
///
/// Serialized as its integer rank (0..=3), which is also how it is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Phase {
    Calm = 0,
    Warm = 1,
    Hot = 2,
    Chaos = 3,
}

impl Phase {
    pub const LADDER: [Phase; 4] = [Phase::Calm, Phase::Warm, Phase::Hot, Phase::Chaos];

    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::LADDER.get(rank as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Calm => "CALM",
            Phase::Warm => "WARM",
            Phase::Hot => "HOT",
            Phase::Chaos => "CHAOS",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Phase> for u8 {
    fn from(p: Phase) -> u8 {
        p.rank()
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(rank: u8) -> Result<Self, Self::Error> {
        Phase::from_rank(rank).ok_or_else(|| format!("invalid phase rank {rank}; expected 0..=3"))
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A mutating event as carried by the event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A user pressed the button.
    Press { request_id: String, timestamp_ms: i64 },
    /// Synthetic decay event appended by the watcher. `observed_phase` is the
    /// phase of the snapshot the watcher looked at.
    Tick { timestamp_ms: i64, observed_phase: Phase },
}

impl Event {
    pub fn press<S: Into<String>>(request_id: S, timestamp_ms: i64) -> Self {
        Event::Press {
            request_id: request_id.into(),
            timestamp_ms,
        }
    }

    pub fn tick(timestamp_ms: i64, observed_phase: Phase) -> Self {
        Event::Tick {
            timestamp_ms,
            observed_phase,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Event::Press { timestamp_ms, .. } | Event::Tick { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    /// Stable kind label used in storage and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Press { .. } => "PRESS",
            Event::Tick { .. } => "TICK",
        }
    }
}

/// An event together with its position in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub offset: i64,
    pub event: Event,
}

impl LoggedEvent {
    pub fn new(offset: i64, event: Event) -> Self {
        Self { offset, event }
    }
}

// ---------------------------------------------------------------------------
// GlobalState
// ---------------------------------------------------------------------------

/// One snapshot of the global button state.
///
/// Snapshots are append-only: the "current" state is the row with the highest
/// `id`. A snapshot that has not been persisted yet has `id == 0` and no
/// `created_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub id: i64,
    /// Highest log offset folded into this snapshot; `-1` before any event.
    pub last_applied_offset: i64,
    pub counter: i64,
    pub phase: Phase,
    /// Always within `[0.0, 1.0]`.
    pub entropy: f64,
    pub reveal_until_ms: i64,
    pub cooldown_ms: i64,
    pub updated_at_ms: i64,
    /// Hash of the ruleset that produced this snapshot.
    pub rules_hash: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl GlobalState {
    /// The implicit state before any event has been applied.
    pub fn genesis<S: Into<String>>(rules_hash: S) -> Self {
        Self {
            id: 0,
            last_applied_offset: -1,
            counter: 0,
            phase: Phase::Calm,
            entropy: 0.0,
            reveal_until_ms: 0,
            cooldown_ms: 0,
            updated_at_ms: 0,
            rules_hash: rules_hash.into(),
            created_at: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }
}

// ---------------------------------------------------------------------------
// Notification payload
// ---------------------------------------------------------------------------

/// Messages published on the notification bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    StateUpdated(GlobalState),
}
