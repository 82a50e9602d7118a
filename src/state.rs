use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};

use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    GaveUp,
}

/// The single published snapshot of process, telemetry and selection state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub running: bool,
    pub pid: Option<u32>,
    pub active_config_path: Option<PathBuf>,
    pub current_node: Option<String>,
    pub upload_total: u64,
    pub download_total: u64,
    pub up_speed: u64,
    pub down_speed: u64,
    pub active_connection_count: usize,
    pub telemetry: LinkStatus,
    pub system_proxy_enabled: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A change request for the state owner.
///
/// Process-scoped updates carry the epoch of the process they belong to;
/// anything from an older process is dropped.
#[derive(Debug)]
pub enum StateUpdate {
    ProcessStarted {
        epoch: u64,
        pid: Option<u32>,
        config_path: PathBuf,
    },
    ProcessStopped {
        epoch: u64,
    },
    Traffic {
        epoch: u64,
        up: u64,
        down: u64,
    },
    Totals {
        epoch: u64,
        upload_total: u64,
        download_total: u64,
        active: usize,
    },
    Link {
        epoch: u64,
        status: LinkStatus,
    },
    CurrentNode(String),
    SystemProxy(bool),
    Barrier(oneshot::Sender<()>),
}

/// Cheap handle to the state owner task.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::UnboundedSender<StateUpdate>,
    rx: watch::Receiver<RuntimeState>,
}

impl StateHandle {
    /// Starts the owner task. It runs until every handle is dropped.
    pub fn spawn(bus: EventBus) -> Self {
        let (tx, updates) = mpsc::unbounded_channel();
        let (snapshot_tx, rx) = watch::channel(RuntimeState::default());
        tokio::spawn(StateOwner::new(bus, snapshot_tx).run(updates));
        Self { tx, rx }
    }

    pub fn apply(&self, update: StateUpdate) {
        let _ = self.tx.send(update);
    }

    /// Resolves once every update sent before this call has been applied.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        self.apply(StateUpdate::Barrier(tx));
        let _ = rx.await;
    }

    pub fn snapshot(&self) -> RuntimeState {
        self.rx.borrow().clone()
    }
}

struct StateOwner {
    state: RuntimeState,
    epoch: u64,
    bus: EventBus,
    snapshot: watch::Sender<RuntimeState>,
}

impl StateOwner {
    fn new(bus: EventBus, snapshot: watch::Sender<RuntimeState>) -> Self {
        Self {
            state: RuntimeState::default(),
            epoch: 0,
            bus,
            snapshot,
        }
    }

    async fn run(mut self, mut updates: mpsc::UnboundedReceiver<StateUpdate>) {
        while let Some(update) = updates.recv().await {
            self.apply(update);
        }
    }

    fn live(&self, epoch: u64) -> bool {
        self.state.running && epoch == self.epoch
    }

    fn apply(&mut self, update: StateUpdate) {
        let mut events = Vec::new();
        match update {
            StateUpdate::ProcessStarted {
                epoch,
                pid,
                config_path,
            } => {
                self.epoch = epoch;
                let s = &mut self.state;
                s.running = true;
                s.pid = pid;
                s.active_config_path = Some(config_path);
                s.up_speed = 0;
                s.down_speed = 0;
                s.upload_total = 0;
                s.download_total = 0;
                s.active_connection_count = 0;
                s.telemetry = LinkStatus::Disconnected;
            }
            StateUpdate::ProcessStopped { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                let s = &mut self.state;
                s.running = false;
                s.pid = None;
                s.up_speed = 0;
                s.down_speed = 0;
                s.active_connection_count = 0;
                s.telemetry = LinkStatus::Disconnected;
            }
            StateUpdate::Traffic { epoch, up, down } => {
                if !self.live(epoch) {
                    return;
                }
                self.state.up_speed = up;
                self.state.down_speed = down;
            }
            StateUpdate::Totals {
                epoch,
                upload_total,
                download_total,
                active,
            } => {
                if !self.live(epoch) {
                    return;
                }
                self.state.upload_total = upload_total;
                self.state.download_total = download_total;
                self.state.active_connection_count = active;
            }
            StateUpdate::Link { epoch, status } => {
                if !self.live(epoch) || self.state.telemetry == status {
                    return;
                }
                self.state.telemetry = status;
                if status == LinkStatus::GaveUp {
                    events.push(Event::TelemetryExhausted);
                }
            }
            StateUpdate::CurrentNode(name) => {
                if self.state.current_node.as_deref() == Some(name.as_str()) {
                    return;
                }
                self.state.current_node = Some(name.clone());
                events.push(Event::NodeChanged { name });
            }
            StateUpdate::SystemProxy(enabled) => {
                self.state.system_proxy_enabled = enabled;
                events.push(Event::ProxyStatusChanged { enabled });
            }
            StateUpdate::Barrier(done) => {
                let _ = done.send(());
                return;
            }
        }

        self.state.last_updated = Some(Utc::now());
        self.snapshot.send_replace(self.state.clone());
        for event in events {
            self.bus.publish(event);
        }
        self.bus.publish(Event::TelemetryUpdate {
            state: self.state.clone(),
        });
    }
}
