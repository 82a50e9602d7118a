//! Tray menu model. Menus are rebuilt from scratch on every refresh and
//! handed to whatever surface renders them.

pub mod builder;
#[cfg(feature = "native-tray")]
pub mod native;

use serde::Serialize;
use std::cmp::Ordering;

use crate::config::ConfigDocument;
use crate::controller::{Delay, ProxyTopology};

pub use builder::{TrayBuilder, TraySurface};

const APP_NAME: &str = "FlyClash";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub name: String,
    /// `None` when the node was never tested.
    pub delay: Option<Delay>,
    pub is_group: bool,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyGroupView {
    pub group_name: String,
    pub primary: bool,
    pub now: Option<String>,
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum MenuAction {
    ShowWindow,
    ToggleSystemProxy { enabled: bool },
    CloseAllConnections,
    SwitchNode { group: String, node: String },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MenuEntry {
    Action {
        id: String,
        label: String,
        action: MenuAction,
    },
    Check {
        id: String,
        label: String,
        checked: bool,
        action: MenuAction,
    },
    Submenu {
        label: String,
        entries: Vec<MenuEntry>,
    },
    Separator,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrayMenu {
    pub tooltip: String,
    pub entries: Vec<MenuEntry>,
}

impl TrayMenu {
    /// Shown while the engine cannot be reached.
    pub fn minimal() -> Self {
        Self {
            tooltip: APP_NAME.to_string(),
            entries: vec![
                action("show", "Show Window", MenuAction::ShowWindow),
                MenuEntry::Separator,
                action("quit", "Quit", MenuAction::Quit),
            ],
        }
    }

    pub fn full(groups: &[ProxyGroupView], current_node: Option<&str>, proxy_enabled: bool) -> Self {
        let mut entries = vec![
            action("show", "Show Window", MenuAction::ShowWindow),
            MenuEntry::Separator,
            MenuEntry::Check {
                id: "system-proxy".to_string(),
                label: "System Proxy".to_string(),
                checked: proxy_enabled,
                action: MenuAction::ToggleSystemProxy {
                    enabled: !proxy_enabled,
                },
            },
            action("close-all", "Close All Connections", MenuAction::CloseAllConnections),
        ];

        if !groups.is_empty() {
            let submenus = groups
                .iter()
                .map(|group| MenuEntry::Submenu {
                    label: group_label(group),
                    entries: group
                        .nodes
                        .iter()
                        .map(|node| MenuEntry::Check {
                            id: node_item_id(&group.group_name, &node.name),
                            label: node_label(node),
                            checked: node.is_current,
                            action: MenuAction::SwitchNode {
                                group: group.group_name.clone(),
                                node: node.name.clone(),
                            },
                        })
                        .collect(),
                })
                .collect();
            entries.push(MenuEntry::Submenu {
                label: "Nodes".to_string(),
                entries: submenus,
            });
        }

        entries.push(MenuEntry::Separator);
        entries.push(action("quit", "Quit", MenuAction::Quit));

        let tooltip = match current_node {
            Some(node) => format!("{APP_NAME} - {node}"),
            None => APP_NAME.to_string(),
        };
        Self { tooltip, entries }
    }

    /// Finds the action behind a menu item id.
    pub fn action(&self, id: &str) -> Option<&MenuAction> {
        find_action(&self.entries, id)
    }
}

impl Default for TrayMenu {
    fn default() -> Self {
        Self::minimal()
    }
}

fn action(id: &str, label: &str, action: MenuAction) -> MenuEntry {
    MenuEntry::Action {
        id: id.to_string(),
        label: label.to_string(),
        action,
    }
}

fn find_action<'a>(entries: &'a [MenuEntry], id: &str) -> Option<&'a MenuAction> {
    entries.iter().find_map(|entry| match entry {
        MenuEntry::Action { id: i, action, .. } | MenuEntry::Check { id: i, action, .. }
            if i == id =>
        {
            Some(action)
        }
        MenuEntry::Submenu { entries, .. } => find_action(entries, id),
        _ => None,
    })
}

/// Item id of a node entry. Built from names so that a click still means
/// the same node after a rebuild reorders the menu.
pub fn node_item_id(group: &str, node: &str) -> String {
    format!(
        "node:{}/{}",
        urlencoding::encode(group),
        urlencoding::encode(node)
    )
}

pub fn node_label(node: &NodeView) -> String {
    let mut label = match node.delay {
        Some(Delay::Millis(ms)) => format!("{} ({}ms)", node.name, ms),
        Some(Delay::Timeout) => format!("{} (timeout)", node.name),
        None => node.name.clone(),
    };
    if node.is_group {
        label.push_str(" [group]");
    }
    label
}

pub fn group_label(group: &ProxyGroupView) -> String {
    if group.primary {
        format!("{} ★", group.group_name)
    } else {
        group.group_name.clone()
    }
}

/// Current node first, then tested nodes by delay, then the rest by name.
pub fn sort_nodes(nodes: &mut [NodeView]) {
    nodes.sort_by(|a, b| {
        b.is_current
            .cmp(&a.is_current)
            .then_with(|| {
                let da = a.delay.and_then(|d| d.as_millis());
                let db = b.delay.and_then(|d| d.as_millis());
                match (da, db) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            })
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Names of the groups whose selection is the app's current node.
///
/// The configured names that exist win; otherwise the first group of the
/// active config is primary.
pub fn primary_groups(
    available: &[&str],
    document: Option<&ConfigDocument>,
    configured: &[String],
) -> Vec<String> {
    let named: Vec<String> = configured
        .iter()
        .filter(|n| available.contains(&n.as_str()))
        .cloned()
        .collect();
    if !named.is_empty() {
        return named;
    }
    document
        .and_then(|d| d.proxy_groups.first())
        .filter(|g| available.contains(&g.name.as_str()))
        .map(|g| vec![g.name.clone()])
        .unwrap_or_default()
}

/// Group views in menu order: primary groups first, then the active
/// config's source order, then by name.
pub fn build_views(
    topology: &ProxyTopology,
    document: Option<&ConfigDocument>,
    configured: &[String],
) -> Vec<ProxyGroupView> {
    let groups: Vec<_> = topology.groups.iter().filter(|g| !g.all.is_empty()).collect();
    let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
    let primary = primary_groups(&names, document, configured);

    let mut views: Vec<ProxyGroupView> = groups
        .into_iter()
        .map(|g| {
            let mut nodes: Vec<NodeView> = g
                .all
                .iter()
                .filter_map(|member| {
                    let info = topology.proxies_by_name.get(member)?;
                    Some(NodeView {
                        name: member.clone(),
                        delay: info.last_delay(),
                        is_group: info.is_group(),
                        is_current: g.now.as_deref() == Some(member.as_str()),
                    })
                })
                .collect();
            sort_nodes(&mut nodes);
            ProxyGroupView {
                group_name: g.name.clone(),
                primary: primary.contains(&g.name),
                now: g.now.clone(),
                nodes,
            }
        })
        .collect();

    views.sort_by_key(|v| {
        (
            primary
                .iter()
                .position(|p| *p == v.group_name)
                .unwrap_or(usize::MAX),
            document
                .and_then(|d| d.group_index(&v.group_name))
                .unwrap_or(usize::MAX),
            v.group_name.clone(),
        )
    });
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::controller::ProxyInfo;
    use crate::controller::types::DelayRecord;
    use std::collections::HashMap;

    fn node(name: &str, delay: Option<Delay>, is_current: bool) -> NodeView {
        NodeView {
            name: name.to_string(),
            delay,
            is_group: false,
            is_current,
        }
    }

    fn info(name: &str, kind: &str, all: &[&str], now: Option<&str>, delay: Option<u32>) -> ProxyInfo {
        ProxyInfo {
            name: name.to_string(),
            kind: kind.to_string(),
            now: now.map(str::to_string),
            all: all.iter().map(|s| s.to_string()).collect(),
            history: delay
                .map(|d| {
                    vec![DelayRecord {
                        time: String::new(),
                        delay: d,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    fn topology(entries: Vec<ProxyInfo>) -> ProxyTopology {
        let map: HashMap<String, ProxyInfo> =
            entries.into_iter().map(|p| (p.name.clone(), p)).collect();
        ProxyTopology::from_map(map)
    }

    #[test]
    fn current_then_delay_then_name() {
        let mut nodes = vec![
            node("B", Some(Delay::Millis(50)), false),
            node("A", None, false),
            node("C", None, true),
            node("D", Some(Delay::Millis(10)), false),
        ];
        sort_nodes(&mut nodes);
        let order: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, ["C", "D", "B", "A"]);
    }

    #[test]
    fn timed_out_nodes_sort_with_untested_ones() {
        let mut nodes = vec![
            node("z", Some(Delay::Timeout), false),
            node("a", None, false),
            node("m", Some(Delay::Millis(300)), false),
        ];
        sort_nodes(&mut nodes);
        let order: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, ["m", "a", "z"]);
    }

    #[test]
    fn labels() {
        assert_eq!(node_label(&node("hk", Some(Delay::Millis(88)), false)), "hk (88ms)");
        assert_eq!(node_label(&node("jp", Some(Delay::Timeout), false)), "jp (timeout)");
        let mut sub = node("auto", None, false);
        sub.is_group = true;
        assert_eq!(node_label(&sub), "auto [group]");
    }

    #[test]
    fn primary_groups_lead_and_config_order_follows() {
        let topo = topology(vec![
            info("zeta", "Selector", &["hk"], Some("hk"), None),
            info("alpha", "URLTest", &["hk", "jp"], Some("jp"), None),
            info("PROXY", "Selector", &["alpha", "hk"], Some("hk"), None),
            info("empty", "Selector", &[], None, None),
            info("hk", "Trojan", &[], None, Some(120)),
            info("jp", "Vmess", &[], None, Some(0)),
        ]);
        let doc = config::parse(
            "proxies:\n  - {name: hk, type: trojan, server: a, port: 1}\n\
             proxy-groups:\n  - {name: zeta, type: select, proxies: [hk]}\n  - {name: alpha, type: url-test, proxies: [hk]}\n",
        )
        .unwrap();
        let views = build_views(&topo, Some(&doc), &["PROXY".into(), "GLOBAL".into()]);

        let order: Vec<_> = views.iter().map(|v| v.group_name.as_str()).collect();
        assert_eq!(order, ["PROXY", "zeta", "alpha"]);
        assert!(views[0].primary);
        assert_eq!(group_label(&views[0]), "PROXY ★");
        assert_eq!(node_label(&views[0].nodes[1]), "alpha [group]");
        assert_eq!(node_label(&views[2].nodes[1]), "hk (120ms)");
    }

    #[test]
    fn first_config_group_is_primary_without_named_ones() {
        let doc = config::parse(
            "proxies:\n  - {name: x, type: ss, server: a, port: 1}\n\
             proxy-groups:\n  - {name: MAIN, type: select, proxies: [x]}\n",
        )
        .unwrap();
        let primary = primary_groups(&["MAIN", "other"], Some(&doc), &["PROXY".into()]);
        assert_eq!(primary, ["MAIN"]);
        assert!(primary_groups(&["other"], Some(&doc), &["PROXY".into()]).is_empty());
    }

    #[test]
    fn node_ids_survive_reordering() {
        let view = |a: u32, b: u32| ProxyGroupView {
            group_name: "PROXY".into(),
            primary: true,
            now: None,
            nodes: {
                let mut nodes = vec![
                    node("a", Some(Delay::Millis(a)), false),
                    node("b", Some(Delay::Millis(b)), false),
                ];
                sort_nodes(&mut nodes);
                nodes
            },
        };
        let before = TrayMenu::full(&[view(10, 20)], None, false);
        let after = TrayMenu::full(&[view(20, 10)], None, false);

        let id = node_item_id("PROXY", "a");
        let expected = MenuAction::SwitchNode {
            group: "PROXY".into(),
            node: "a".into(),
        };
        assert_eq!(before.action(&id), Some(&expected));
        assert_eq!(after.action(&id), Some(&expected));
    }

    #[test]
    fn node_ids_escape_separators() {
        assert_eq!(node_item_id("🇭🇰 HK/1", "a b"), "node:%F0%9F%87%AD%F0%9F%87%B0%20HK%2F1/a%20b");
        assert_ne!(node_item_id("a/b", "c"), node_item_id("a", "b/c"));
    }

    #[test]
    fn menu_actions_resolve_by_id() {
        let group = ProxyGroupView {
            group_name: "PROXY".into(),
            primary: true,
            now: Some("hk".into()),
            nodes: vec![node("hk", None, true), node("jp", None, false)],
        };
        let menu = TrayMenu::full(&[group], Some("hk"), false);

        assert_eq!(menu.tooltip, "FlyClash - hk");
        assert_eq!(
            menu.action("node:PROXY/jp"),
            Some(&MenuAction::SwitchNode {
                group: "PROXY".into(),
                node: "jp".into()
            })
        );
        assert_eq!(
            menu.action("system-proxy"),
            Some(&MenuAction::ToggleSystemProxy { enabled: true })
        );
        assert_eq!(menu.action("nope"), None);
        assert_eq!(TrayMenu::minimal().action("quit"), Some(&MenuAction::Quit));
    }
}
