use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Engine entry types that behave as selectable groups.
pub const GROUP_KINDS: [&str; 4] = ["Selector", "URLTest", "Fallback", "LoadBalance"];

/// One entry of `GET /proxies`: a leaf proxy or a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub now: Option<String>,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub history: Vec<DelayRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayRecord {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub delay: u32,
}

impl ProxyInfo {
    pub fn is_group(&self) -> bool {
        GROUP_KINDS.contains(&self.kind.as_str())
    }

    /// Result of the latest delay test, if the engine has run one for this entry.
    pub fn last_delay(&self) -> Option<Delay> {
        self.history.last().map(|h| Delay::from_millis(h.delay))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProxiesResponse {
    #[serde(default)]
    pub proxies: HashMap<String, ProxyInfo>,
}

/// Live topology as reported by the engine.
#[derive(Debug, Clone, Default)]
pub struct ProxyTopology {
    /// Recognized groups, by name.
    pub groups: Vec<ProxyInfo>,
    pub proxies_by_name: HashMap<String, ProxyInfo>,
}

impl ProxyTopology {
    pub(crate) fn from_map(mut proxies: HashMap<String, ProxyInfo>) -> Self {
        for (name, info) in proxies.iter_mut() {
            if info.name.is_empty() {
                info.name = name.clone();
            }
        }
        let mut groups: Vec<ProxyInfo> = proxies.values().filter(|p| p.is_group()).cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            groups,
            proxies_by_name: proxies,
        }
    }
}

/// Outcome of a latency test. Zero or missing delays are never success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Delay {
    Millis(u32),
    Timeout,
}

impl Delay {
    pub fn from_millis(ms: u32) -> Self {
        if ms == 0 { Delay::Timeout } else { Delay::Millis(ms) }
    }

    pub fn as_millis(&self) -> Option<u32> {
        match self {
            Delay::Millis(ms) => Some(*ms),
            Delay::Timeout => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsSnapshot {
    #[serde(default)]
    pub upload_total: u64,
    #[serde(default)]
    pub download_total: u64,
    // The engine sends `null` rather than `[]` when idle.
    #[serde(default, rename = "connections")]
    items: Option<Vec<ConnectionItem>>,
}

impl ConnectionsSnapshot {
    pub fn items(&self) -> &[ConnectionItem] {
        self.items.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionItem {
    pub id: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DelayResponse {
    pub delay: Option<serde_json::Number>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionResponse {
    #[serde(default)]
    pub version: String,
}

/// One frame of the `/traffic` stream, bytes per second.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrafficFrame {
    pub up: u64,
    pub down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_recognizes_groups_and_fills_names() {
        let body = r#"{"proxies":{
            "PROXY":{"type":"Selector","now":"hk","all":["hk","jp","auto"]},
            "auto":{"type":"URLTest","now":"jp","all":["hk","jp"]},
            "lb":{"type":"LoadBalance","all":["hk"]},
            "hk":{"type":"Trojan","history":[{"time":"t","delay":0},{"time":"t","delay":88}]},
            "jp":{"type":"Vmess","history":[{"time":"t","delay":0}]},
            "DIRECT":{"type":"Direct"}
        }}"#;
        let parsed: ProxiesResponse = serde_json::from_str(body).unwrap();
        let topo = ProxyTopology::from_map(parsed.proxies);

        let names: Vec<_> = topo.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["PROXY", "auto", "lb"]);
        assert_eq!(topo.proxies_by_name["hk"].last_delay(), Some(Delay::Millis(88)));
        assert_eq!(topo.proxies_by_name["jp"].last_delay(), Some(Delay::Timeout));
        assert_eq!(topo.proxies_by_name["DIRECT"].last_delay(), None);
    }

    #[test]
    fn null_connections_read_as_empty() {
        let snap: ConnectionsSnapshot =
            serde_json::from_str(r#"{"downloadTotal":10,"uploadTotal":4,"connections":null}"#)
                .unwrap();
        assert!(snap.items().is_empty());
        assert_eq!((snap.upload_total, snap.download_total), (4, 10));
    }
}
