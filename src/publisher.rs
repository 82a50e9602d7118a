use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigDocument;
use crate::controller::{ControllerClient, Delay};
use crate::error::{CommandError, StartError};
use crate::events::{Event, EventBus};
use crate::persist::PersistStore;
use crate::settings::Settings;
use crate::state::{RuntimeState, StateHandle};
use crate::supervisor::{ProcessHandle, Supervisor};
use crate::sysproxy::{ProxyBackend, SystemProxy};
use crate::tray::{self, MenuAction, ProxyGroupView, TrayBuilder, TrayMenu, TraySurface};

#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: Event,
}

/// Bounded history of bus events, numbered so pollers can resume.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<EventRing>>,
}

struct EventRing {
    next_seq: u64,
    capacity: usize,
    events: VecDeque<SequencedEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventRing {
                next_seq: 1,
                capacity: capacity.max(1),
                events: VecDeque::new(),
            })),
        }
    }

    pub fn push(&self, event: Event) {
        let Ok(mut ring) = self.inner.lock() else {
            return;
        };
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.events.len() == ring.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(SequencedEvent { seq, event });
    }

    /// Events with a sequence number above `seq`, oldest first.
    pub fn since(&self, seq: u64) -> Vec<SequencedEvent> {
        self.inner
            .lock()
            .map(|ring| ring.events.iter().filter(|e| e.seq > seq).cloned().collect())
            .unwrap_or_default()
    }

    /// Copies everything published on `bus` into the log.
    pub fn follow(&self, bus: &EventBus) {
        let mut rx = bus.subscribe();
        let log = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log.push(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[IPC] Event log lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}

/// The only component that talks to the UI. Every command is bounded by
/// the command timeout and fails with a typed reason.
pub struct Core {
    settings: Arc<Settings>,
    client: ControllerClient,
    state: StateHandle,
    bus: EventBus,
    supervisor: Supervisor,
    sysproxy: Arc<SystemProxy>,
    tray: Arc<TrayBuilder>,
    events: EventLog,
    shutdown: CancellationToken,
}

impl Core {
    pub fn new(
        settings: Settings,
        backend: Arc<dyn ProxyBackend>,
        surfaces: Vec<Arc<dyn TraySurface>>,
    ) -> Arc<Self> {
        let settings = Arc::new(settings);
        let bus = EventBus::new(1024);
        let events = EventLog::new(settings.event_buffer);
        events.follow(&bus);

        let state = StateHandle::spawn(bus.clone());
        let persist = PersistStore::new(&settings.data_dir);
        let sysproxy = Arc::new(SystemProxy::new(
            backend,
            persist.clone(),
            state.clone(),
            &settings.system_proxy,
        ));
        let client = ControllerClient::from_settings(&settings);
        let supervisor = Supervisor::new(
            settings.clone(),
            client.clone(),
            state.clone(),
            bus.clone(),
            persist,
            sysproxy.clone(),
        );
        let tray = surfaces.into_iter().fold(
            TrayBuilder::new(
                client.clone(),
                supervisor.clone(),
                state.clone(),
                settings.tray.clone(),
            ),
            TrayBuilder::with_surface,
        );

        Arc::new(Self {
            settings,
            client,
            state,
            bus,
            supervisor,
            sysproxy,
            tray: Arc::new(tray),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts the periodic tray rebuild.
    pub fn spawn_tray(&self) {
        tokio::spawn(self.tray.clone().run(self.bus.clone()));
    }

    /// Cancelled when the user picks Quit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    async fn bounded<T, F>(&self, name: &'static str, fut: F) -> Result<T, CommandError>
    where
        F: Future<Output = Result<T, CommandError>>,
    {
        tokio::time::timeout(self.settings.command_timeout(), fut)
            .await
            .map_err(|_| CommandError::Timeout(name))?
    }

    /// Without a path, relaunches the last config that started.
    pub async fn start(&self, path: Option<PathBuf>) -> Result<ProcessHandle, CommandError> {
        self.bounded("start", async {
            let handle = match path {
                Some(path) => self.supervisor.start(&path).await?,
                None => self.supervisor.restart().await?,
            };
            Ok::<_, CommandError>(handle)
        })
        .await
    }

    pub async fn stop(&self) -> Result<bool, CommandError> {
        self.bounded("stop", async { Ok(self.supervisor.stop().await) })
            .await
    }

    pub async fn restart(&self) -> Result<ProcessHandle, CommandError> {
        self.bounded("restart", async {
            Ok::<_, CommandError>(self.supervisor.restart().await?)
        })
        .await
    }

    pub async fn switch_node(&self, group: &str, node: &str) -> Result<(), CommandError> {
        self.bounded("switchNode", async {
            self.client.switch_node(group, node).await?;
            // Any group's check mark may have moved; the rebuild also
            // carries a primary-group switch into the current node.
            self.tray.rebuild().await;
            self.state.sync().await;
            Ok::<_, CommandError>(())
        })
        .await
    }

    pub async fn toggle_system_proxy(&self, enabled: bool) -> Result<bool, CommandError> {
        self.bounded("toggleSystemProxy", async {
            self.sysproxy.set_enabled(enabled).await?;
            Ok::<_, CommandError>(enabled)
        })
        .await
    }

    pub async fn test_delay(&self, node: &str) -> Result<Delay, CommandError> {
        self.bounded("testDelay", async {
            let delay = self
                .client
                .test_delay(node, &self.settings.test_url, self.settings.delay_timeout_ms)
                .await?;
            Ok::<_, CommandError>(delay)
        })
        .await
    }

    pub async fn close_connection(&self, id: &str) -> Result<(), CommandError> {
        self.bounded("closeConnection", async {
            self.client.close_connection(id).await?;
            self.bus.publish(Event::ConnectionsClosed {
                id: Some(id.to_string()),
            });
            Ok::<_, CommandError>(())
        })
        .await
    }

    pub async fn close_all(&self) -> Result<(), CommandError> {
        self.bounded("closeAll", async {
            self.client.close_all().await?;
            log::info!("[IPC] Closed all connections");
            self.bus.publish(Event::ConnectionsClosed { id: None });
            Ok::<_, CommandError>(())
        })
        .await
    }

    pub fn state(&self) -> RuntimeState {
        self.state.snapshot()
    }

    /// Live groups in tray order.
    pub async fn proxies(&self) -> Result<Vec<ProxyGroupView>, CommandError> {
        self.bounded("proxies", async {
            let topology = self.client.list_proxies().await?;
            let document = self.supervisor.active_document().await;
            Ok::<_, CommandError>(tray::build_views(
                &topology,
                document.as_ref(),
                self.tray.configured_primary(),
            ))
        })
        .await
    }

    /// Source order of the running config.
    pub async fn config_order(&self) -> Option<ConfigDocument> {
        self.supervisor.active_document().await
    }

    pub async fn proxy_status(&self) -> Result<bool, CommandError> {
        self.bounded("proxyStatus", async {
            Ok::<_, CommandError>(self.sysproxy.status().await?)
        })
        .await
    }

    pub async fn patch_config(&self, patch: Value) -> Result<(), CommandError> {
        self.bounded("patchConfig", async {
            if self.supervisor.handle().await.is_none() {
                return Err(CommandError::NotRunning);
            }
            self.client.patch_configs(patch).await?;
            Ok(())
        })
        .await
    }

    pub async fn live_config(&self) -> Result<Value, CommandError> {
        self.bounded("liveConfig", async {
            Ok::<_, CommandError>(self.client.get_configs().await?)
        })
        .await
    }

    /// Engine version; doubles as a liveness check.
    pub async fn engine_version(&self) -> Result<String, CommandError> {
        self.bounded("version", async {
            Ok::<_, CommandError>(self.client.version().await?)
        })
        .await
    }

    pub fn tray_menu(&self) -> TrayMenu {
        self.tray.menu()
    }

    /// Runs the action behind a tray item and returns it, so the caller can
    /// handle window-level actions.
    pub async fn activate_tray_item(&self, id: &str) -> Result<MenuAction, CommandError> {
        let action = self
            .tray
            .menu()
            .action(id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownMenuItem(id.to_string()))?;
        log::info!("[Tray] Activated {}", id);

        match &action {
            MenuAction::ShowWindow => {}
            MenuAction::ToggleSystemProxy { enabled } => {
                self.toggle_system_proxy(*enabled).await?;
            }
            MenuAction::CloseAllConnections => self.close_all().await?,
            MenuAction::SwitchNode { group, node } => self.switch_node(group, node).await?,
            MenuAction::Quit => self.shutdown.cancel(),
        }
        Ok(action)
    }

    /// Launches the last used config, if there is one.
    pub async fn autostart(&self) {
        match self.start(None).await {
            Ok(handle) => log::info!("[IPC] Resumed {}", handle.config_path.display()),
            Err(CommandError::Start(StartError::NoConfig)) => {
                log::info!("[IPC] No previous config, waiting for a start command")
            }
            Err(e) => log::warn!("[IPC] Could not resume last config: {}", e),
        }
    }

    /// Stops the engine and best-effort disables the OS proxy we enabled.
    pub async fn teardown(&self) {
        let budget = self.settings.stop_timeout() + self.sysproxy_timeout();
        let work = async {
            self.supervisor.stop().await;
            self.sysproxy.teardown().await;
        };
        if tokio::time::timeout(budget, work).await.is_err() {
            log::warn!("[IPC] Teardown timed out");
        }
    }

    fn sysproxy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settings.system_proxy.timeout_ms)
    }
}
