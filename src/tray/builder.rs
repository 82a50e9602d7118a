use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::controller::ControllerClient;
use crate::events::{Event, EventBus};
use crate::settings::TraySettings;
use crate::state::{StateHandle, StateUpdate};
use crate::supervisor::Supervisor;
use crate::tray::{TrayMenu, build_views};

/// Something that can display a tray menu.
pub trait TraySurface: Send + Sync {
    fn apply(&self, menu: &TrayMenu);
}

/// Rebuilds the tray menu on a fixed interval and after selection changes.
pub struct TrayBuilder {
    client: ControllerClient,
    supervisor: Supervisor,
    state: StateHandle,
    settings: TraySettings,
    latest: watch::Sender<TrayMenu>,
    surfaces: Vec<Arc<dyn TraySurface>>,
}

impl TrayBuilder {
    pub fn new(
        client: ControllerClient,
        supervisor: Supervisor,
        state: StateHandle,
        settings: TraySettings,
    ) -> Self {
        let (latest, _) = watch::channel(TrayMenu::minimal());
        Self {
            client,
            supervisor,
            state,
            settings,
            latest,
            surfaces: Vec::new(),
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn TraySurface>) -> Self {
        self.surfaces.push(surface);
        self
    }

    pub fn menu(&self) -> TrayMenu {
        self.latest.borrow().clone()
    }

    pub fn configured_primary(&self) -> &[String] {
        &self.settings.primary_groups
    }

    /// Fetches the live topology and publishes a fresh menu.
    pub async fn rebuild(&self) -> TrayMenu {
        let menu = match self.client.list_proxies().await {
            Ok(topology) => {
                let document = self.supervisor.active_document().await;
                let views = build_views(&topology, document.as_ref(), &self.settings.primary_groups);

                let current = views
                    .iter()
                    .find(|v| v.primary)
                    .and_then(|v| v.now.clone());
                if let Some(node) = &current {
                    self.state.apply(StateUpdate::CurrentNode(node.clone()));
                }
                let proxy_enabled = self.state.snapshot().system_proxy_enabled;
                log::debug!("[Tray] Rebuilt menu with {} groups", views.len());
                TrayMenu::full(&views, current.as_deref(), proxy_enabled)
            }
            Err(e) => {
                log::warn!("[Tray] Engine unavailable, showing basic menu: {}", e);
                TrayMenu::minimal()
            }
        };

        self.latest.send_replace(menu.clone());
        for surface in &self.surfaces {
            surface.apply(&menu);
        }
        menu
    }

    /// Runs until the event bus closes.
    pub async fn run(self: Arc<Self>, bus: EventBus) {
        let mut events = bus.subscribe();
        let period = Duration::from_secs(self.settings.refresh_interval_secs.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                event = events.recv() => match event {
                    Ok(Event::NodeChanged { .. })
                    | Ok(Event::ProxyStatusChanged { .. })
                    | Ok(Event::ProcessStarted { .. })
                    | Ok(Event::ProcessStopped { .. })
                    | Ok(Event::ProcessCrashed { .. }) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
            self.rebuild().await;
        }
    }
}
