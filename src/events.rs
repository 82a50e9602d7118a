use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::state::RuntimeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Everything a subsystem can announce. Only the publisher turns these into
/// UI traffic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    ProcessStarted { pid: Option<u32>, config_path: PathBuf },
    ProcessStopped { code: Option<i32> },
    ProcessCrashed { code: Option<i32> },
    #[serde(rename_all = "camelCase")]
    Recovered { config_path: PathBuf },
    RecoveryFailed { reason: String },
    FatalError { reason: String },
    TelemetryUpdate { state: RuntimeState },
    TelemetryExhausted,
    NodeChanged { name: String },
    ProxyStatusChanged { enabled: bool },
    LogLine { stream: LogStream, text: String },
    ConnectionsClosed { id: Option<String> },
}

/// Broadcast bus shared by every subsystem.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
