use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const LAST_CONFIG_FILE: &str = "last-config.json";
const PROXY_CONFIG_FILE: &str = "proxy-config.json";

/// What the previous session wanted, read once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedDesiredState {
    pub last_used_config_path: Option<PathBuf>,
    pub system_proxy_enabled: Option<bool>,
}

#[derive(Serialize, Deserialize)]
struct LastConfigRecord {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct ProxyRecord {
    enabled: bool,
}

/// Small JSON records in the data directory.
#[derive(Debug, Clone)]
pub struct PersistStore {
    dir: PathBuf,
}

impl PersistStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Unreadable or corrupt records read as absent.
    pub fn load(&self) -> PersistedDesiredState {
        let last: Option<LastConfigRecord> = self.read(LAST_CONFIG_FILE);
        let proxy: Option<ProxyRecord> = self.read(PROXY_CONFIG_FILE);
        PersistedDesiredState {
            last_used_config_path: last.map(|r| r.path),
            system_proxy_enabled: proxy.map(|r| r.enabled),
        }
    }

    pub fn save_last_config(&self, path: &Path) -> io::Result<()> {
        self.write(
            LAST_CONFIG_FILE,
            &LastConfigRecord {
                path: path.to_path_buf(),
            },
        )
    }

    pub fn save_system_proxy(&self, enabled: bool) -> io::Result<()> {
        self.write(PROXY_CONFIG_FILE, &ProxyRecord { enabled })
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("[Persist] Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("[Persist] Ignoring corrupt {}: {}", path.display(), e);
                None
            }
        }
    }

    // Write-then-rename so a crash never leaves a half-written record.
    fn write<T: Serialize>(&self, name: &str, value: &T) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.dir.join(name))
    }
}
