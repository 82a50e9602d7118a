use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::SysProxyError;
use crate::persist::PersistStore;
use crate::settings::SystemProxySettings;
use crate::state::{StateHandle, StateUpdate};

/// Where the OS should send proxied traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub bypass: Vec<String>,
}

impl ProxyEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// OS-specific mutation of the system proxy setting.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    async fn apply(&self, enabled: bool, endpoint: &ProxyEndpoint) -> Result<(), SysProxyError>;
    async fn query(&self) -> Result<bool, SysProxyError>;
}

/// Registry on Windows, `networksetup` on macOS, GNOME `gsettings` on Linux.
pub struct PlatformBackend;

#[cfg(windows)]
const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

#[async_trait]
impl ProxyBackend for PlatformBackend {
    #[cfg(windows)]
    async fn apply(&self, enabled: bool, endpoint: &ProxyEndpoint) -> Result<(), SysProxyError> {
        let flag = if enabled { "1" } else { "0" };
        if enabled {
            let server = endpoint.address();
            run("reg", &["add", INTERNET_SETTINGS, "/v", "ProxyServer", "/t", "REG_SZ", "/d", &server, "/f"]).await?;
            let bypass = endpoint.bypass.join(";");
            run("reg", &["add", INTERNET_SETTINGS, "/v", "ProxyOverride", "/t", "REG_SZ", "/d", &bypass, "/f"]).await?;
        }
        run("reg", &["add", INTERNET_SETTINGS, "/v", "ProxyEnable", "/t", "REG_DWORD", "/d", flag, "/f"]).await?;
        Ok(())
    }

    #[cfg(windows)]
    async fn query(&self) -> Result<bool, SysProxyError> {
        let out = run("reg", &["query", INTERNET_SETTINGS, "/v", "ProxyEnable"]).await?;
        Ok(out.contains("0x1"))
    }

    #[cfg(target_os = "macos")]
    async fn apply(&self, enabled: bool, endpoint: &ProxyEndpoint) -> Result<(), SysProxyError> {
        let port = endpoint.port.to_string();
        let state = if enabled { "on" } else { "off" };
        for service in network_services().await? {
            if enabled {
                for kind in ["-setwebproxy", "-setsecurewebproxy", "-setsocksfirewallproxy"] {
                    run("networksetup", &[kind, &service, &endpoint.host, &port]).await?;
                }
                let mut args = vec!["-setproxybypassdomains", service.as_str()];
                args.extend(endpoint.bypass.iter().map(String::as_str));
                run("networksetup", &args).await?;
            }
            for kind in [
                "-setwebproxystate",
                "-setsecurewebproxystate",
                "-setsocksfirewallproxystate",
            ] {
                run("networksetup", &[kind, &service, state]).await?;
            }
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    async fn query(&self) -> Result<bool, SysProxyError> {
        let services = network_services().await?;
        let Some(service) = services.first() else {
            return Ok(false);
        };
        let out = run("networksetup", &["-getwebproxy", service]).await?;
        Ok(out.lines().any(|l| l.trim() == "Enabled: Yes"))
    }

    #[cfg(target_os = "linux")]
    async fn apply(&self, enabled: bool, endpoint: &ProxyEndpoint) -> Result<(), SysProxyError> {
        if enabled {
            let port = endpoint.port.to_string();
            for schema in [
                "org.gnome.system.proxy.http",
                "org.gnome.system.proxy.https",
                "org.gnome.system.proxy.socks",
            ] {
                run("gsettings", &["set", schema, "host", &endpoint.host]).await?;
                run("gsettings", &["set", schema, "port", &port]).await?;
            }
            let ignore = format!(
                "[{}]",
                endpoint
                    .bypass
                    .iter()
                    .map(|h| format!("'{h}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            run("gsettings", &["set", "org.gnome.system.proxy", "ignore-hosts", &ignore]).await?;
        }
        let mode = if enabled { "manual" } else { "none" };
        run("gsettings", &["set", "org.gnome.system.proxy", "mode", mode]).await?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn query(&self) -> Result<bool, SysProxyError> {
        let out = run("gsettings", &["get", "org.gnome.system.proxy", "mode"]).await?;
        Ok(out.trim() == "'manual'")
    }

    #[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
    async fn apply(&self, _enabled: bool, _endpoint: &ProxyEndpoint) -> Result<(), SysProxyError> {
        Err(SysProxyError::Unsupported)
    }

    #[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
    async fn query(&self) -> Result<bool, SysProxyError> {
        Err(SysProxyError::Unsupported)
    }
}

#[cfg(target_os = "macos")]
async fn network_services() -> Result<Vec<String>, SysProxyError> {
    let out = run("networksetup", &["-listallnetworkservices"]).await?;
    // First line is a legend; disabled services are marked with `*`.
    Ok(out
        .lines()
        .skip(1)
        .filter(|l| !l.is_empty() && !l.contains('*'))
        .map(str::to_string)
        .collect())
}

#[cfg_attr(
    not(any(windows, target_os = "macos", target_os = "linux")),
    allow(dead_code)
)]
async fn run(program: &str, args: &[&str]) -> Result<String, SysProxyError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(SysProxyError::Command {
            command: format!("{} {}", program, args.join(" ")),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Desired-state owner for the OS proxy setting.
///
/// A change is published and persisted only after the OS accepted it.
pub struct SystemProxy {
    backend: Arc<dyn ProxyBackend>,
    persist: PersistStore,
    state: StateHandle,
    endpoint: Mutex<ProxyEndpoint>,
    timeout: Duration,
    // Whether this process turned the OS proxy on.
    applied: AtomicBool,
    serial: tokio::sync::Mutex<()>,
}

impl SystemProxy {
    pub fn new(
        backend: Arc<dyn ProxyBackend>,
        persist: PersistStore,
        state: StateHandle,
        settings: &SystemProxySettings,
    ) -> Self {
        Self {
            backend,
            persist,
            state,
            endpoint: Mutex::new(ProxyEndpoint {
                host: settings.host.clone(),
                port: settings.port,
                bypass: settings.bypass.clone(),
            }),
            timeout: Duration::from_millis(settings.timeout_ms),
            applied: AtomicBool::new(false),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Follows the listener port of the active config.
    pub fn set_port(&self, port: u16) {
        if let Ok(mut e) = self.endpoint.lock() {
            e.port = port;
        }
    }

    pub fn endpoint(&self) -> Option<ProxyEndpoint> {
        self.endpoint.lock().ok().map(|e| e.clone())
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), SysProxyError> {
        let _guard = self.serial.lock().await;
        self.apply_os(enabled).await?;

        if let Err(e) = self.persist.save_system_proxy(enabled) {
            log::warn!("[SysProxy] Failed to persist state: {}", e);
        }
        self.state.apply(StateUpdate::SystemProxy(enabled));
        if enabled {
            let address = self.endpoint().map(|e| e.address()).unwrap_or_default();
            log::info!("[SysProxy] System proxy enabled -> {}", address);
        } else {
            log::info!("[SysProxy] System proxy disabled");
        }
        Ok(())
    }

    /// Applies the on/off state saved by the previous session, if any.
    pub async fn reapply_persisted(&self) -> Result<(), SysProxyError> {
        match self.persist.load().system_proxy_enabled {
            Some(enabled) => self.set_enabled(enabled).await,
            None => Ok(()),
        }
    }

    /// Desired state, with the OS brought back in line when it drifted.
    pub async fn status(&self) -> Result<bool, SysProxyError> {
        match self.persist.load().system_proxy_enabled {
            Some(desired) => {
                let actual = self.query_os().await?;
                if actual != desired {
                    log::info!("[SysProxy] OS state drifted, reapplying {}", desired);
                    self.set_enabled(desired).await?;
                }
                Ok(desired)
            }
            None => {
                let actual = self.query_os().await?;
                if let Err(e) = self.persist.save_system_proxy(actual) {
                    log::warn!("[SysProxy] Failed to persist state: {}", e);
                }
                Ok(actual)
            }
        }
    }

    /// Best-effort disable on exit. The persisted desired state is kept so
    /// the next session turns the proxy back on.
    pub async fn teardown(&self) {
        if !self.applied.load(Ordering::Acquire) {
            return;
        }
        match self.apply_os(false).await {
            Ok(()) => log::info!("[SysProxy] System proxy disabled on exit"),
            Err(e) => log::warn!("[SysProxy] Failed to disable on exit: {}", e),
        }
    }

    async fn apply_os(&self, enabled: bool) -> Result<(), SysProxyError> {
        let endpoint = self.endpoint().ok_or(SysProxyError::Unsupported)?;
        tokio::time::timeout(self.timeout, self.backend.apply(enabled, &endpoint))
            .await
            .map_err(|_| SysProxyError::Timeout)??;
        self.applied.store(enabled, Ordering::Release);
        Ok(())
    }

    async fn query_os(&self) -> Result<bool, SysProxyError> {
        tokio::time::timeout(self.timeout, self.backend.query())
            .await
            .map_err(|_| SysProxyError::Timeout)?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::testutil::TempDir;

    /// Records every call and keeps a fake OS flag.
    #[derive(Default)]
    pub struct FakeBackend {
        pub fail: AtomicBool,
        pub os_enabled: AtomicBool,
        pub calls: Mutex<Vec<(bool, u16)>>,
    }

    #[async_trait]
    impl ProxyBackend for FakeBackend {
        async fn apply(&self, enabled: bool, endpoint: &ProxyEndpoint) -> Result<(), SysProxyError> {
            self.calls.lock().unwrap().push((enabled, endpoint.port));
            if self.fail.load(Ordering::SeqCst) {
                return Err(SysProxyError::Command {
                    command: "fake".into(),
                    message: "denied".into(),
                });
            }
            self.os_enabled.store(enabled, Ordering::SeqCst);
            Ok(())
        }

        async fn query(&self) -> Result<bool, SysProxyError> {
            Ok(self.os_enabled.load(Ordering::SeqCst))
        }
    }

    fn toggle(dir: &TempDir, backend: Arc<FakeBackend>) -> (SystemProxy, StateHandle) {
        let state = StateHandle::spawn(EventBus::default());
        let proxy = SystemProxy::new(
            backend,
            PersistStore::new(dir.path()),
            state.clone(),
            &SystemProxySettings::default(),
        );
        (proxy, state)
    }

    #[tokio::test]
    async fn failed_mutation_changes_nothing() {
        let dir = TempDir::new();
        let backend = Arc::new(FakeBackend::default());
        backend.fail.store(true, Ordering::SeqCst);
        let (proxy, state) = toggle(&dir, backend);

        assert!(proxy.set_enabled(true).await.is_err());
        state.sync().await;
        assert!(!state.snapshot().system_proxy_enabled);
        assert_eq!(PersistStore::new(dir.path()).load().system_proxy_enabled, None);
    }

    #[tokio::test]
    async fn persisted_state_is_reapplied_next_session() {
        let dir = TempDir::new();
        let first = Arc::new(FakeBackend::default());
        let (proxy, _) = toggle(&dir, first.clone());
        proxy.set_enabled(true).await.unwrap();
        assert_eq!(PersistStore::new(dir.path()).load().system_proxy_enabled, Some(true));

        let second = Arc::new(FakeBackend::default());
        let (proxy, state) = toggle(&dir, second.clone());
        proxy.set_port(7891);
        proxy.reapply_persisted().await.unwrap();
        state.sync().await;

        assert_eq!(*second.calls.lock().unwrap(), [(true, 7891)]);
        assert!(state.snapshot().system_proxy_enabled);
    }

    #[tokio::test]
    async fn teardown_only_undoes_what_we_enabled() {
        let dir = TempDir::new();
        let backend = Arc::new(FakeBackend::default());
        let (proxy, _) = toggle(&dir, backend.clone());

        proxy.teardown().await;
        assert!(backend.calls.lock().unwrap().is_empty());

        proxy.set_enabled(true).await.unwrap();
        proxy.teardown().await;
        assert!(!backend.os_enabled.load(Ordering::SeqCst));
        assert_eq!(PersistStore::new(dir.path()).load().system_proxy_enabled, Some(true));
    }

    #[tokio::test]
    async fn status_repairs_drift() {
        let dir = TempDir::new();
        let backend = Arc::new(FakeBackend::default());
        let (proxy, _) = toggle(&dir, backend.clone());
        proxy.set_enabled(true).await.unwrap();

        backend.os_enabled.store(false, Ordering::SeqCst);
        assert!(proxy.status().await.unwrap());
        assert!(backend.os_enabled.load(Ordering::SeqCst));
    }
}
