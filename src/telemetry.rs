use crate::state::{MetricsSnapshot, StatusReport, TelemetryEvent};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::warn;

/// Run-scoped totals. Written only by the emission loop.
#[derive(Debug, Clone, Copy)]
pub struct Counters {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub started_at: Instant,
}

impl Counters {
    pub fn new(started_at: Instant) -> Self {
        Self {
            bytes_sent: 0,
            packets_sent: 0,
            send_errors: 0,
            started_at,
        }
    }
}

/// Turns counters into snapshots. The reported bandwidth covers only the
/// window since the previous snapshot so the curve follows the envelope.
#[derive(Debug)]
pub struct TelemetryAggregator {
    last_bytes: u64,
    last_at: Instant,
}

impl TelemetryAggregator {
    pub fn new(started_at: Instant) -> Self {
        Self {
            last_bytes: 0,
            last_at: started_at,
        }
    }

    pub fn snapshot(&mut self, counters: &Counters, now: Instant) -> MetricsSnapshot {
        let window = now.saturating_duration_since(self.last_at).as_secs_f64();
        let delta = counters.bytes_sent.saturating_sub(self.last_bytes);
        let current_bandwidth_mbps = if window > 0.0 {
            (delta as f64 * 8.0) / 1_000_000.0 / window
        } else {
            0.0
        };
        self.last_bytes = counters.bytes_sent;
        self.last_at = now;

        MetricsSnapshot {
            current_bandwidth_mbps,
            total_bytes_sent: counters.bytes_sent,
            elapsed_secs: now.saturating_duration_since(counters.started_at).as_secs_f64(),
            packets_sent: counters.packets_sent,
            send_errors: counters.send_errors,
        }
    }
}

/// Best-effort fan-out. Publishing never waits on subscribers; one that
/// falls more than the channel capacity behind loses the oldest events.
#[derive(Clone)]
pub struct TelemetryBroadcaster {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: TelemetryEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Attaches to the stream first, then hands out `initial` ahead of it, so
    /// nothing published after the state was captured is missed.
    pub fn subscribe(&self, initial: StatusReport) -> Subscription {
        Subscription {
            initial: Some(initial),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription {
    initial: Option<StatusReport>,
    rx: broadcast::Receiver<TelemetryEvent>,
}

impl Subscription {
    /// Next event for this subscriber, the state dump first. `None` once the
    /// broadcaster is gone.
    pub async fn next(&mut self) -> Option<TelemetryEvent> {
        if let Some(state) = self.initial.take() {
            return Some(TelemetryEvent::State(state));
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Telemetry subscriber lagging, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
