use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;

use crate::controller::{ControllerClient, TrafficFrame};
use crate::settings::TelemetrySettings;
use crate::state::{LinkStatus, StateHandle, StateUpdate};

/// Traffic link plus health/totals ticker for one engine process.
///
/// A pipeline is bound to the epoch of the process it was started for and
/// is never reused; the supervisor starts a fresh one on every start.
pub struct TelemetryPipeline {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct Link {
    epoch: u64,
    client: ControllerClient,
    state: StateHandle,
    settings: TelemetrySettings,
    cancel: CancellationToken,
    tracker: TaskTracker,
    kick: Notify,
    status: Mutex<LinkStatus>,
    last_frame: Mutex<Instant>,
    totals_in_flight: Arc<AtomicBool>,
}

enum SessionEnd {
    Closed,
    Failed(String),
    Cancelled,
}

impl TelemetryPipeline {
    pub fn start(
        epoch: u64,
        client: ControllerClient,
        state: StateHandle,
        settings: TelemetrySettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let link = Arc::new(Link {
            epoch,
            client,
            state,
            settings,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            kick: Notify::new(),
            status: Mutex::new(LinkStatus::Disconnected),
            last_frame: Mutex::new(Instant::now()),
            totals_in_flight: Arc::new(AtomicBool::new(false)),
        });

        tracker.spawn(link.clone().run_link());
        tracker.spawn(link.run_health());
        Self { cancel, tracker }
    }

    /// Cancels every task and waits for them to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Link {
    fn set_status(&self, status: LinkStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
        self.state.apply(StateUpdate::Link {
            epoch: self.epoch,
            status,
        });
    }

    fn status(&self) -> LinkStatus {
        self.status.lock().map(|s| *s).unwrap_or_default()
    }

    fn mark_frame(&self) {
        if let Ok(mut t) = self.last_frame.lock() {
            *t = Instant::now();
        }
    }

    fn is_stale(&self) -> bool {
        let stale_after = Duration::from_millis(self.settings.stale_after_ms);
        self.last_frame
            .lock()
            .map(|t| t.elapsed() >= stale_after)
            .unwrap_or(false)
    }

    async fn run_link(self: Arc<Self>) {
        let mut budget = self.settings.retry_budget;
        let delay = Duration::from_millis(self.settings.reconnect_delay_ms);

        loop {
            self.set_status(LinkStatus::Connecting);
            match self.session(&mut budget).await {
                SessionEnd::Cancelled => {
                    self.set_status(LinkStatus::Closing);
                    return;
                }
                SessionEnd::Closed => log::info!("[Telemetry] Traffic stream closed"),
                SessionEnd::Failed(e) => log::warn!("[Telemetry] Traffic stream failed: {}", e),
            }
            self.set_status(LinkStatus::Disconnected);

            if budget == 0 {
                log::error!("[Telemetry] Retry budget exhausted, giving up");
                self.set_status(LinkStatus::GaveUp);
                return;
            }
            budget -= 1;
            log::info!("[Telemetry] Reconnecting ({} retries left)", budget);

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
                _ = self.kick.notified() => {}
            }
        }
    }

    async fn session(&self, budget: &mut u32) -> SessionEnd {
        let connect_timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let mut request = match url::Url::parse(&self.client.traffic_url())
            .map_err(|e| e.to_string())
            .and_then(|u| u.as_str().into_client_request().map_err(|e| e.to_string()))
        {
            Ok(r) => r,
            Err(e) => return SessionEnd::Failed(e),
        };
        if let Some(secret) = self.client.secret() {
            match format!("Bearer {secret}").parse() {
                Ok(v) => {
                    request.headers_mut().insert("Authorization", v);
                }
                Err(_) => return SessionEnd::Failed("secret is not a valid header".into()),
            }
        }

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            r = tokio::time::timeout(connect_timeout, connect_async(request)) => r,
        };
        let mut ws = match connected {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return SessionEnd::Failed(e.to_string()),
            Err(_) => return SessionEnd::Failed("connect timed out".into()),
        };

        *budget = self.settings.retry_budget;
        self.mark_frame();
        self.set_status(LinkStatus::Connected);
        log::info!("[Telemetry] Traffic stream connected");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Cancelled;
                }
                _ = self.kick.notified() => {
                    if self.is_stale() {
                        return SessionEnd::Failed("no traffic frame within the stale window".into());
                    }
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => self.on_frame(&bytes),
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                },
            }
        }
    }

    fn on_frame(&self, payload: &[u8]) {
        match serde_json::from_slice::<TrafficFrame>(payload) {
            Ok(frame) => {
                self.mark_frame();
                self.state.apply(StateUpdate::Traffic {
                    epoch: self.epoch,
                    up: frame.up,
                    down: frame.down,
                });
                self.refresh_totals();
            }
            Err(e) => log::debug!("[Telemetry] Ignoring malformed frame: {}", e),
        }
    }

    /// At most one connections poll is in flight; extra requests are dropped.
    fn refresh_totals(&self) {
        if self.totals_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = self.client.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let in_flight = self.totals_in_flight.clone();
        let epoch = self.epoch;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                r = client.list_connections() => match r {
                    Ok(snap) => state.apply(StateUpdate::Totals {
                        epoch,
                        upload_total: snap.upload_total,
                        download_total: snap.download_total,
                        active: snap.items().len(),
                    }),
                    Err(e) => log::debug!("[Telemetry] Connections poll failed: {}", e),
                },
            }
            in_flight.store(false, Ordering::Release);
        });
    }

    async fn run_health(self: Arc<Self>) {
        let period = Duration::from_millis(self.settings.health_interval_ms);
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            match self.status() {
                LinkStatus::GaveUp => return,
                LinkStatus::Disconnected => self.kick.notify_one(),
                LinkStatus::Connected if self.is_stale() => {
                    log::warn!("[Telemetry] Traffic stream went silent");
                    self.kick.notify_one();
                }
                _ => {}
            }
            self.refresh_totals();
        }
    }
}
