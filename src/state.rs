use crate::config::RunConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
}

/// One periodic measurement. The first three field names are what the web
/// client charts; the rest are extra and ignored by older clients.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(rename = "currentBandwidth")]
    pub current_bandwidth_mbps: f64,
    #[serde(rename = "totalSent")]
    pub total_bytes_sent: u64,
    #[serde(rename = "elapsedTime")]
    pub elapsed_secs: f64,
    pub packets_sent: u64,
    pub send_errors: u64,
}

/// Point-in-time view for `GetStatus` and for the state dump a subscriber
/// receives on connect. Only this shape carries `config`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub config: RunConfig,
    pub is_running: bool,
    pub state: RunState,
    pub metrics: MetricsSnapshot,
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct RunTerminated {
    pub event: &'static str,
    pub reason: String,
    pub metrics: MetricsSnapshot,
}

impl RunTerminated {
    pub fn new(reason: String, metrics: MetricsSnapshot) -> Self {
        Self {
            event: "runTerminated",
            reason,
            metrics,
        }
    }
}

/// Everything pushed over the telemetry stream, one JSON object per event.
#[derive(Clone, Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum TelemetryEvent {
    State(StatusReport),
    Snapshot(MetricsSnapshot),
    Terminated(RunTerminated),
}
