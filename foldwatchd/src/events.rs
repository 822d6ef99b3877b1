//! Event broadcast for poll results (JSON lines).

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Emitted after every completed poll cycle.
pub const WORKER_POLLED: &str = "worker.polled";
/// Emitted when a poll cycle ends with an undeterminable status.
pub const WORKER_STATUS_UNKNOWN: &str = "worker.status_unknown";

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
    timestamp: String,
}

/// Broadcast channel for daemon events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus. The buffer is never smaller than
    /// `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit `{event, data, timestamp}` as one JSON line. Having no
    /// subscribers is not an error.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let envelope = Envelope {
            event,
            data,
            timestamp: Utc::now().to_rfc3339(),
        };
        match serde_json::to_string(&envelope) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!(event, error = %err, "Failed to serialize event"),
        }
    }
}
