//! Request dispatch results and the stats-query report shape.

use serde::{Deserialize, Serialize};
use weir_common::control as wire;

use crate::pipeline::StatsSnapshot;

/// Result of dispatching one control request: a wire status code plus the
/// response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u32,
    pub payload: Vec<u8>,
}

impl ControlResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: wire::STATUS_OK,
            payload,
        }
    }

    pub fn status(status: u32) -> Self {
        Self {
            status,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == wire::STATUS_OK
    }
}

/// Per-instance counters as serialized into the stats-query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub id: u64,
    pub adapter: String,
    pub state: String,
    pub pending_send: u64,
    pub pending_recv: u64,
    pub ruleset_version: u64,
}

/// Full stats-query response payload (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub global: StatsSnapshot,
    pub instances: Vec<InstanceStats>,
}
