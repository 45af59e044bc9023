//! Read-only status surface for the surrounding application.

use crate::stats::StatsSnapshot;
use serde::{Deserialize, Serialize};

/// `{connected, server, assignedAddress}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    pub server: String,
    pub assigned_address: String,
}

impl StatusReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `{bytesIn, bytesOut, packetsIn, packetsOut, durationSeconds}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub duration_seconds: u64,
}

impl StatsReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&StatsSnapshot> for StatsReport {
    fn from(snap: &StatsSnapshot) -> Self {
        Self {
            bytes_in: snap.bytes_in,
            bytes_out: snap.bytes_out,
            packets_in: snap.packets_in,
            packets_out: snap.packets_out,
            duration_seconds: snap.connected_duration.as_secs(),
        }
    }
}
