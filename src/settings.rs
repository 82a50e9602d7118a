use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings. Every field has a default so an absent or partial
/// `settings.yaml` is fine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Directory holding `settings.yaml`, persisted state and the core's work dir.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path of the proxy-core binary; defaults to `<data_dir>/cores/<name>`.
    pub core: Option<PathBuf>,
    /// `host:port` of the core's external controller.
    pub controller: String,
    pub secret: Option<String>,
    /// Pass `-ext-ctl` (and `-secret`) so the core listens where the client looks.
    pub override_controller: bool,

    pub request_timeout_ms: u64,
    pub test_url: String,
    pub delay_timeout_ms: u64,

    pub start_grace_ms: u64,
    pub restart_delay_ms: u64,
    pub crash_window_secs: u64,
    pub stop_timeout_ms: u64,

    pub telemetry: TelemetrySettings,
    pub tray: TraySettings,
    pub system_proxy: SystemProxySettings,

    /// Loopback address of the UI command server.
    pub ipc_listen: String,
    pub event_buffer: usize,
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TelemetrySettings {
    pub retry_budget: u32,
    pub reconnect_delay_ms: u64,
    pub health_interval_ms: u64,
    /// A connected socket silent for this long is treated as dead.
    pub stale_after_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TraySettings {
    pub refresh_interval_secs: u64,
    pub primary_groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SystemProxySettings {
    pub host: String,
    pub port: u16,
    pub bypass: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            core: None,
            controller: "127.0.0.1:9090".to_string(),
            secret: None,
            override_controller: true,
            request_timeout_ms: 5_000,
            test_url: "http://www.gstatic.com/generate_204".to_string(),
            delay_timeout_ms: 5_000,
            start_grace_ms: 1_000,
            restart_delay_ms: 1_000,
            crash_window_secs: 30,
            stop_timeout_ms: 5_000,
            telemetry: TelemetrySettings::default(),
            tray: TraySettings::default(),
            system_proxy: SystemProxySettings::default(),
            ipc_listen: "127.0.0.1:9097".to_string(),
            event_buffer: 1_000,
            command_timeout_ms: 15_000,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            retry_budget: 10,
            reconnect_delay_ms: 1_000,
            health_interval_ms: 1_000,
            stale_after_ms: 5_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl Default for TraySettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            primary_groups: vec!["PROXY".to_string(), "GLOBAL".to_string()],
        }
    }
}

impl Default for SystemProxySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7890,
            bypass: vec![
                "localhost".to_string(),
                "127.*".to_string(),
                "10.*".to_string(),
                "192.168.*".to_string(),
                "<local>".to_string(),
            ],
            timeout_ms: 5_000,
        }
    }
}

impl Settings {
    /// Loads `<data_dir>/settings.yaml` (if any) and applies `FLYCLASH_*`
    /// environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let data_dir = env::var_os("FLYCLASH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let path = data_dir.join("settings.yaml");

        let mut settings: Settings = if path.exists() {
            serde_yaml::from_str(&fs::read_to_string(&path)?)?
        } else {
            Settings::default()
        };
        settings.data_dir = data_dir;
        settings.apply_env(|key| env::var(key).ok());
        Ok(settings)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(core) = var("FLYCLASH_CORE") {
            self.core = Some(PathBuf::from(core));
        }
        if let Some(controller) = var("FLYCLASH_CONTROLLER") {
            self.controller = controller;
        }
        if let Some(secret) = var("FLYCLASH_SECRET") {
            self.secret = Some(secret).filter(|s| !s.is_empty());
        }
        if let Some(ipc) = var("FLYCLASH_IPC") {
            self.ipc_listen = ipc;
        }
    }

    pub fn core_path(&self) -> PathBuf {
        self.core
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cores").join(default_core_name()))
    }

    /// Private directory the core runs in.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("mihomo")
    }

    pub fn controller_url(&self) -> String {
        format!("http://{}", self.controller)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Settings rooted at `dir`, used by tests and portable installs.
    pub fn rooted_at(dir: &Path) -> Self {
        Settings {
            data_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }
}

fn default_core_name() -> &'static str {
    if cfg!(windows) {
        "mihomo-windows-amd64.exe"
    } else {
        "mihomo"
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        if let Some(appdata) = env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("flyclash");
        }
    }
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("flyclash");
    }
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("flyclash");
    }
    PathBuf::from(".flyclash")
}
