//! Ruleset model and validation.

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LoadedConfig;

/// Parameters of the state-transition function.
///
/// Immutable once loaded; identified by the hash of its canonical JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Entropy added by one press (before clamping to 1.0).
    pub entropy_increment: f64,
    /// Entropy lost per elapsed millisecond.
    pub decay_rate: f64,
    /// Inclusive lower bounds of WARM, HOT and CHAOS over entropy.
    pub thresholds: [f64; 3],
    /// Cooldown gating WARM -> CALM.
    pub cooldown_warm_ms: i64,
    /// Cooldown gating CHAOS -> HOT and HOT -> WARM.
    pub cooldown_chaos_ms: i64,

    #[serde(default)]
    pub reveal_calm_ms: i64,
    #[serde(default)]
    pub reveal_warm_ms: i64,
    #[serde(default)]
    pub reveal_hot_ms: i64,
    #[serde(default)]
    pub reveal_chaos_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RulesError {
    /// A numeric field is NaN or infinite.
    NonFinite { field: &'static str },
    /// A field that must be >= 0 is negative.
    Negative { field: &'static str },
    /// `entropy_increment` is outside `[0, 1]`.
    IncrementOutOfRange(f64),
    /// A threshold is outside `(0, 1]`.
    ThresholdOutOfRange { index: usize, value: f64 },
    /// Thresholds are not strictly ascending.
    ThresholdsNotAscending([f64; 3]),
}

impl fmt::Display for RulesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulesError::NonFinite { field } => write!(f, "RULES_INVALID: {field} is not finite"),
            RulesError::Negative { field } => write!(f, "RULES_INVALID: {field} must be >= 0"),
            RulesError::IncrementOutOfRange(v) => {
                write!(f, "RULES_INVALID: entropy_increment={v} outside [0, 1]")
            }
            RulesError::ThresholdOutOfRange { index, value } => {
                write!(f, "RULES_INVALID: thresholds[{index}]={value} outside (0, 1]")
            }
            RulesError::ThresholdsNotAscending(t) => {
                write!(f, "RULES_INVALID: thresholds {t:?} must be strictly ascending")
            }
        }
    }
}

impl std::error::Error for RulesError {}

impl RulesConfig {
    /// Check the invariants the transition function relies on.
    pub fn validate(&self) -> Result<(), RulesError> {
        let floats: [(&'static str, f64); 2] = [
            ("entropy_increment", self.entropy_increment),
            ("decay_rate", self.decay_rate),
        ];
        for (field, v) in floats {
            if !v.is_finite() {
                return Err(RulesError::NonFinite { field });
            }
            if v < 0.0 {
                return Err(RulesError::Negative { field });
            }
        }
        if self.entropy_increment > 1.0 {
            return Err(RulesError::IncrementOutOfRange(self.entropy_increment));
        }

        for (index, &value) in self.thresholds.iter().enumerate() {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(RulesError::ThresholdOutOfRange { index, value });
            }
        }
        if !(self.thresholds[0] < self.thresholds[1] && self.thresholds[1] < self.thresholds[2]) {
            return Err(RulesError::ThresholdsNotAscending(self.thresholds));
        }

        let ints: [(&'static str, i64); 6] = [
            ("cooldown_warm_ms", self.cooldown_warm_ms),
            ("cooldown_chaos_ms", self.cooldown_chaos_ms),
            ("reveal_calm_ms", self.reveal_calm_ms),
            ("reveal_warm_ms", self.reveal_warm_ms),
            ("reveal_hot_ms", self.reveal_hot_ms),
            ("reveal_chaos_ms", self.reveal_chaos_ms),
        ];
        for (field, v) in ints {
            if v < 0 {
                return Err(RulesError::Negative { field });
            }
        }
        Ok(())
    }

    /// Deserialize and validate from a merged JSON document.
    pub fn from_json(v: &Value) -> Result<Self> {
        let cfg: RulesConfig =
            serde_json::from_value(v.clone()).context("ruleset does not match RulesConfig")?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// A validated [`RulesConfig`] together with its content hash.
#[derive(Clone, Debug, PartialEq)]
pub struct Ruleset {
    pub hash: String,
    pub config: RulesConfig,
}

impl Ruleset {
    pub fn new<S: Into<String>>(hash: S, config: RulesConfig) -> Self {
        Self {
            hash: hash.into(),
            config,
        }
    }

    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let config = RulesConfig::from_json(&loaded.config_json)?;
        Ok(Self {
            hash: loaded.config_hash.clone(),
            config,
        })
    }
}
