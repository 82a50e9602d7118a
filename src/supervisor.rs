use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{self, ConfigDocument};
use crate::controller::ControllerClient;
use crate::error::StartError;
use crate::events::{Event, EventBus, LogStream};
use crate::persist::PersistStore;
use crate::settings::Settings;
use crate::state::{StateHandle, StateUpdate};
use crate::sysproxy::SystemProxy;
use crate::telemetry::TelemetryPipeline;

const LOCAL_CONFIG: &str = "config.yaml";

/// Snapshot of the live engine process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub binary: PathBuf,
    pub work_dir: PathBuf,
    /// Path the user asked for.
    pub config_path: PathBuf,
    /// Copy inside the work dir the engine actually reads.
    pub local_config: PathBuf,
    pub pid: Option<u32>,
    /// Exit code of the previous process, if there was one.
    pub last_exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

struct Running {
    handle: ProcessHandle,
    document: ConfigDocument,
    epoch: u64,
    kill: oneshot::Sender<()>,
    watcher: JoinHandle<Option<i32>>,
    telemetry: TelemetryPipeline,
}

#[derive(Default)]
struct Slot {
    running: Option<Running>,
    next_epoch: u64,
    last_config: Option<PathBuf>,
    last_exit: Option<i32>,
    // Set when a crash was answered with an automatic restart.
    auto_restarted_at: Option<Instant>,
}

/// Unrequested exit of the process started under `epoch`.
struct Exit {
    epoch: u64,
    code: Option<i32>,
}

/// Owns zero or one running engine process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Arc<Settings>,
    client: ControllerClient,
    state: StateHandle,
    bus: EventBus,
    persist: PersistStore,
    sysproxy: Arc<SystemProxy>,
    exits: mpsc::UnboundedSender<Exit>,
    slot: Mutex<Slot>,
}

impl Supervisor {
    pub fn new(
        settings: Arc<Settings>,
        client: ControllerClient,
        state: StateHandle,
        bus: EventBus,
        persist: PersistStore,
        sysproxy: Arc<SystemProxy>,
    ) -> Self {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let slot = Slot {
            last_config: persist.load().last_used_config_path,
            ..Slot::default()
        };
        let inner = Arc::new(Inner {
            settings,
            client,
            state,
            bus,
            persist,
            sysproxy,
            exits,
            slot: Mutex::new(slot),
        });
        tokio::spawn(monitor_crashes(inner.clone(), exit_rx));
        Self { inner }
    }

    /// Validates `path` and (re)launches the engine against it.
    ///
    /// A running process is only replaced once the new config validated.
    pub async fn start(&self, path: &Path) -> Result<ProcessHandle, StartError> {
        let mut slot = self.inner.slot.lock().await;
        slot.auto_restarted_at = None;
        self.inner.launch(&mut slot, path).await
    }

    /// Starts against the last config that started successfully.
    pub async fn restart(&self) -> Result<ProcessHandle, StartError> {
        let mut slot = self.inner.slot.lock().await;
        let path = slot.last_config.clone().ok_or(StartError::NoConfig)?;
        slot.auto_restarted_at = None;
        self.inner.launch(&mut slot, &path).await
    }

    /// Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        match slot.running.take() {
            Some(running) => {
                let code = self.inner.terminate(running).await;
                slot.last_exit = code;
                true
            }
            None => false,
        }
    }

    pub async fn handle(&self) -> Option<ProcessHandle> {
        let slot = self.inner.slot.lock().await;
        slot.running.as_ref().map(|r| r.handle.clone())
    }

    /// Parsed document of the running config.
    pub async fn active_document(&self) -> Option<ConfigDocument> {
        let slot = self.inner.slot.lock().await;
        slot.running.as_ref().map(|r| r.document.clone())
    }

    pub async fn last_config(&self) -> Option<PathBuf> {
        self.inner.slot.lock().await.last_config.clone()
    }
}

impl Inner {
    async fn launch(&self, slot: &mut Slot, path: &Path) -> Result<ProcessHandle, StartError> {
        let config_path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let document = config::validate(&config_path)?;

        let binary = self.settings.core_path();
        if !binary.exists() {
            return Err(StartError::BinaryMissing(binary));
        }

        if let Some(previous) = slot.running.take() {
            log::info!("[Supervisor] Replacing running core (pid {:?})", previous.handle.pid);
            slot.last_exit = self.terminate(previous).await;
        }

        let work_dir = self.settings.work_dir();
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(StartError::WorkDir)?;
        let local_config = work_dir.join(LOCAL_CONFIG);
        tokio::fs::copy(&config_path, &local_config)
            .await
            .map_err(StartError::WorkDir)?;

        let mut child = self
            .command(&binary, &work_dir, &local_config)
            .spawn()
            .map_err(|e| spawn_error(e, &binary))?;
        let pid = child.id();
        log::info!(
            "[Supervisor] Started {} (pid {:?}) with {}",
            binary.display(),
            pid,
            config_path.display()
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, LogStream::Stdout, self.bus.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, LogStream::Stderr, self.bus.clone());
        }

        slot.next_epoch += 1;
        let epoch = slot.next_epoch;
        let (kill, kill_rx) = oneshot::channel();
        let mut watcher = tokio::spawn(watch_exit(child, epoch, kill_rx, self.exits.clone()));

        if let Ok(joined) = tokio::time::timeout(self.settings.start_grace(), &mut watcher).await {
            let code = joined.ok().flatten();
            log::error!("[Supervisor] Core exited during startup (code {:?})", code);
            slot.last_exit = code;
            return Err(StartError::ImmediateExit { code });
        }

        if let Err(e) = self.persist.save_last_config(&config_path) {
            log::warn!("[Supervisor] Failed to persist last config: {}", e);
        }
        slot.last_config = Some(config_path.clone());

        // The state owner must know the epoch before the link reports on it.
        self.state.apply(StateUpdate::ProcessStarted {
            epoch,
            pid,
            config_path: config_path.clone(),
        });
        let telemetry = TelemetryPipeline::start(
            epoch,
            self.client.clone(),
            self.state.clone(),
            self.settings.telemetry.clone(),
        );

        self.sysproxy.set_port(
            document
                .listen_port()
                .unwrap_or(self.settings.system_proxy.port),
        );
        if let Err(e) = self.sysproxy.reapply_persisted().await {
            log::warn!("[Supervisor] Failed to reapply system proxy: {}", e);
        }

        let handle = ProcessHandle {
            binary,
            work_dir,
            config_path: config_path.clone(),
            local_config,
            pid,
            last_exit_code: slot.last_exit,
            started_at: Utc::now(),
        };
        slot.running = Some(Running {
            handle: handle.clone(),
            document,
            epoch,
            kill,
            watcher,
            telemetry,
        });
        self.bus.publish(Event::ProcessStarted { pid, config_path });
        Ok(handle)
    }

    fn command(&self, binary: &Path, work_dir: &Path, local_config: &Path) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg("-d").arg(work_dir).arg("-f").arg(local_config);
        if self.settings.override_controller {
            cmd.arg("-ext-ctl").arg(&self.settings.controller);
            if let Some(secret) = &self.settings.secret {
                cmd.arg("-secret").arg(secret);
            }
        }
        cmd.current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Kills the process, waits for it and stops its telemetry.
    async fn terminate(&self, running: Running) -> Option<i32> {
        let Running {
            epoch,
            kill,
            mut watcher,
            telemetry,
            ..
        } = running;

        telemetry.stop().await;
        let _ = kill.send(());
        let code = match tokio::time::timeout(self.settings.stop_timeout(), &mut watcher).await {
            Ok(joined) => joined.ok().flatten(),
            Err(_) => {
                log::warn!("[Supervisor] Core did not exit in time, abandoning it");
                watcher.abort();
                None
            }
        };

        self.state.apply(StateUpdate::ProcessStopped { epoch });
        self.bus.publish(Event::ProcessStopped { code });
        log::info!("[Supervisor] Core stopped (code {:?})", code);
        code
    }
}

/// Owns the child until it exits. Exits not caused by `kill` are reported
/// to the crash monitor.
async fn watch_exit(
    mut child: Child,
    epoch: u64,
    kill: oneshot::Receiver<()>,
    exits: mpsc::UnboundedSender<Exit>,
) -> Option<i32> {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill => {
            if let Err(e) = child.start_kill() {
                log::warn!("[Supervisor] Failed to kill core: {}", e);
            }
            (child.wait().await, true)
        }
    };
    let code = status.ok().and_then(|s| s.code());
    if !requested {
        let _ = exits.send(Exit { epoch, code });
    }
    code
}

async fn monitor_crashes(inner: Arc<Inner>, mut exits: mpsc::UnboundedReceiver<Exit>) {
    while let Some(Exit { epoch, code }) = exits.recv().await {
        let mut slot = inner.slot.lock().await;
        // Exits during the startup grace window are reported by `launch`.
        if slot.running.as_ref().map(|r| r.epoch) != Some(epoch) {
            continue;
        }
        if let Some(running) = slot.running.take() {
            running.telemetry.stop().await;
        }
        slot.last_exit = code;
        inner.state.apply(StateUpdate::ProcessStopped { epoch });
        inner.bus.publish(Event::ProcessCrashed { code });
        log::error!("[Supervisor] Core crashed (code {:?})", code);

        let now = Instant::now();
        let window = inner.settings.crash_window();
        if slot
            .auto_restarted_at
            .is_some_and(|at| now.duration_since(at) < window)
        {
            slot.auto_restarted_at = None;
            let reason = format!("core crashed again within {}s of a restart", window.as_secs());
            log::error!("[Supervisor] {}, not restarting", reason);
            inner.bus.publish(Event::FatalError { reason });
            continue;
        }
        slot.auto_restarted_at = Some(now);
        drop(slot);

        tokio::time::sleep(inner.settings.restart_delay()).await;

        let mut slot = inner.slot.lock().await;
        if slot.running.is_some() {
            // Someone started a process while we waited.
            continue;
        }
        let Some(path) = slot.last_config.clone() else {
            inner.bus.publish(Event::RecoveryFailed {
                reason: StartError::NoConfig.to_string(),
            });
            continue;
        };
        match inner.launch(&mut slot, &path).await {
            Ok(handle) => {
                log::info!("[Supervisor] Recovered with {}", handle.config_path.display());
                inner.bus.publish(Event::Recovered {
                    config_path: handle.config_path,
                });
            }
            Err(e) => {
                log::error!("[Supervisor] Recovery failed: {}", e);
                inner.bus.publish(Event::RecoveryFailed {
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn forward_output<R>(reader: R, stream: LogStream, bus: EventBus)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match stream {
                LogStream::Stdout => log::info!("[mihomo] {}", line),
                LogStream::Stderr => log::warn!("[mihomo] {}", line),
            }
            bus.publish(Event::LogLine { stream, text: line });
        }
    });
}

fn spawn_error(e: io::Error, binary: &Path) -> StartError {
    match e.kind() {
        io::ErrorKind::NotFound => StartError::BinaryMissing(binary.to_path_buf()),
        io::ErrorKind::PermissionDenied => StartError::PermissionDenied(binary.to_path_buf()),
        _ => StartError::Spawn(e),
    }
}
