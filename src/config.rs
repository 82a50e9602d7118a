use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// A parsed routing config, reduced to what the control layer needs.
///
/// Groups and proxies keep the order they have in the source file; the tray
/// and the UI rely on it for deterministic ordering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub proxy_groups: Vec<ProxyGroup>,
    pub proxies: Vec<Proxy>,
    pub mixed_port: Option<u16>,
    pub port: Option<u16>,
    pub external_controller: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyGroup {
    pub name: String,
    pub kind: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proxy {
    pub name: String,
    pub kind: String,
    pub server: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "mixed-port")]
    mixed_port: Option<u16>,
    port: Option<u16>,
    #[serde(rename = "external-controller")]
    external_controller: Option<String>,

    proxies: Option<Vec<RawProxy>>,
    #[serde(rename = "proxy-groups")]
    proxy_groups: Option<Vec<RawProxyGroup>>,
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    name: Option<String>,
    #[serde(rename = "type", default)]
    proxy_type: String,
    #[serde(default)]
    server: String,
    port: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawProxyGroup {
    name: Option<String>,
    #[serde(rename = "type", default)]
    group_type: String,
    #[serde(default)]
    proxies: Vec<String>,
}

/// Reads and validates the config at `path`.
pub fn validate(path: impl AsRef<Path>) -> Result<ConfigDocument, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<ConfigDocument, ConfigError> {
    let raw: Option<RawConfig> = serde_yaml::from_str(content)?;
    let raw = raw.ok_or(ConfigError::MissingSection("proxies"))?;

    let proxies = raw.proxies.ok_or(ConfigError::MissingSection("proxies"))?;
    let groups = raw
        .proxy_groups
        .ok_or(ConfigError::MissingSection("proxy-groups"))?;

    // Nameless entries are dropped, so emptiness is judged on what is left.
    let proxies: Vec<Proxy> = proxies
        .into_iter()
        .filter_map(|p| {
            let name = p.name?;
            Some(Proxy {
                name,
                kind: p.proxy_type,
                server: p.server,
                port: p.port.as_ref().and_then(port_value).unwrap_or(0),
            })
        })
        .collect();

    let proxy_groups: Vec<ProxyGroup> = groups
        .into_iter()
        .filter_map(|g| {
            Some(ProxyGroup {
                name: g.name?,
                kind: g.group_type,
                members: g.proxies,
            })
        })
        .collect();

    if proxies.is_empty() {
        return Err(ConfigError::EmptySection("proxies"));
    }
    if proxy_groups.is_empty() {
        return Err(ConfigError::EmptySection("proxy-groups"));
    }

    Ok(ConfigDocument {
        proxy_groups,
        proxies,
        mixed_port: raw.mixed_port,
        port: raw.port,
        external_controller: raw.external_controller,
    })
}

// Subscription configs write ports both as numbers and as strings.
fn port_value(v: &serde_yaml::Value) -> Option<u16> {
    match v {
        serde_yaml::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl ConfigDocument {
    /// Port the engine serves local HTTP/SOCKS clients on, if the file sets one.
    pub fn listen_port(&self) -> Option<u16> {
        self.mixed_port.or(self.port)
    }

    /// Position of a group in the source file.
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.proxy_groups.iter().position(|g| g.name == name)
    }
}
