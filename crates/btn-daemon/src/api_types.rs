//! Response types for btn-daemon HTTP endpoints.
//!
//! `GET /v1/state` returns `btn_schemas::GlobalState` as-is.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. "NO_STATE".
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: &str) -> Self {
        Self {
            error: code.to_string(),
        }
    }
}
