//! Test doubles: a fake engine control API, throwaway directories and
//! shell-script stand-ins for the core binary.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{Value, json};
use tokio::sync::{Notify, oneshot};
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::Role;
use tungstenite::Message;

pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("flyclash-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// A loopback port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Writes an executable `/bin/sh` script standing in for the core binary.
#[cfg(unix)]
pub fn fake_core(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(format!("core-{}.sh", uuid::Uuid::new_v4()));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Minimal routing config with one selector group.
pub fn write_config(dir: &Path, name: &str, group: &str, nodes: &[&str]) -> PathBuf {
    let mut yaml = String::from("mixed-port: 7890\nproxies:\n");
    for n in nodes {
        yaml.push_str(&format!("  - name: {n}\n    type: ss\n    server: {n}.example.com\n    port: 8388\n"));
    }
    yaml.push_str(&format!(
        "proxy-groups:\n  - name: {group}\n    type: select\n    proxies: [{}]\n",
        nodes.join(", ")
    ));
    let path = dir.join(name);
    std::fs::write(&path, yaml).unwrap();
    path
}

#[derive(Default)]
pub struct EngineState {
    proxies: BTreeMap<String, Value>,
    ignore_switch: bool,
    connections: Vec<Value>,
    upload_total: u64,
    download_total: u64,
    configs: Value,
    traffic: Option<(u64, u64)>,
    connection_polls: usize,
    // While set, `GET /connections` waits for it to be notified.
    connections_gate: Option<Arc<Notify>>,
}

/// In-process stand-in for the engine's REST + WebSocket controller.
pub struct FakeEngine {
    addr: SocketAddr,
    state: Arc<Mutex<EngineState>>,
    pub traffic_sockets: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(EngineState {
            configs: json!({ "mode": "rule", "mixed-port": 7890 }),
            traffic: Some((1024, 2048)),
            ..EngineState::default()
        }));
        let sockets = Arc::new(AtomicUsize::new(0));

        let make_svc = {
            let state = state.clone();
            let sockets = sockets.clone();
            make_service_fn(move |_| {
                let state = state.clone();
                let sockets = sockets.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        handle(req, state.clone(), sockets.clone())
                    }))
                }
            })
        };

        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.with_graceful_shutdown(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            state,
            traffic_sockets: sockets,
            shutdown: Some(tx),
        }
    }

    /// `host:port`, as used by `Settings::controller`.
    pub fn controller(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn add_group(&self, name: &str, kind: &str, members: &[&str], now: &str) {
        self.state.lock().unwrap().proxies.insert(
            name.to_string(),
            json!({ "name": name, "type": kind, "now": now, "all": members, "history": [] }),
        );
    }

    /// `delay: None` makes delay tests time out and leaves no history.
    pub fn add_node(&self, name: &str, delay: Option<u32>) {
        let history = match delay {
            Some(d) => json!([{ "time": "2024-01-01T00:00:00Z", "delay": d }]),
            None => json!([]),
        };
        self.state.lock().unwrap().proxies.insert(
            name.to_string(),
            json!({ "name": name, "type": "Shadowsocks", "history": history }),
        );
    }

    pub fn now_of(&self, group: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.proxies.get(group)?.get("now")?.as_str().map(str::to_string)
    }

    pub fn set_ignore_switch(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_switch = ignore;
    }

    pub fn set_connections(&self, ids: &[&str], upload_total: u64, download_total: u64) {
        let mut state = self.state.lock().unwrap();
        state.connections = ids
            .iter()
            .map(|id| json!({ "id": id, "upload": 1, "download": 2, "chains": ["DIRECT"], "rule": "Match" }))
            .collect();
        state.upload_total = upload_total;
        state.download_total = download_total;
    }

    pub fn set_traffic(&self, up: u64, down: u64) {
        self.state.lock().unwrap().traffic = Some((up, down));
    }

    /// Keeps traffic sockets open but stops sending frames.
    pub fn silence_traffic(&self) {
        self.state.lock().unwrap().traffic = None;
    }

    /// Holds every `GET /connections` until [`Self::release_connections`].
    pub fn stall_connections(&self) {
        self.state.lock().unwrap().connections_gate = Some(Arc::new(Notify::new()));
    }

    pub fn release_connections(&self) {
        if let Some(gate) = self.state.lock().unwrap().connections_gate.take() {
            gate.notify_waiters();
        }
    }

    pub fn connection_polls(&self) -> usize {
        self.state.lock().unwrap().connection_polls
    }

    pub fn configs(&self) -> Value {
        self.state.lock().unwrap().configs.clone()
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle(
    req: Request<Body>,
    state: Arc<Mutex<EngineState>>,
    sockets: Arc<AtomicUsize>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_default())
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let method = req.method().clone();

    if method == Method::GET && segments == ["traffic"] {
        return Ok(upgrade_traffic(req, state, sockets));
    }

    if method == Method::GET && segments == ["connections"] {
        let gate = {
            let mut st = state.lock().unwrap();
            st.connection_polls += 1;
            st.connections_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let mut st = state.lock().unwrap();

    let resp = match (&method, segments.as_slice()) {
        (&Method::GET, ["version"]) => json_response(StatusCode::OK, json!({ "version": "fake" })),
        (&Method::GET, ["proxies"]) => {
            json_response(StatusCode::OK, json!({ "proxies": st.proxies.clone() }))
        }
        (&Method::GET, ["proxies", name]) => match st.proxies.get(*name) {
            Some(p) => json_response(StatusCode::OK, p.clone()),
            None => not_found(),
        },
        (&Method::PUT, ["proxies", name]) => {
            let target = body.get("name").and_then(Value::as_str).map(str::to_string);
            let ignore = st.ignore_switch;
            match (st.proxies.get_mut(*name), target) {
                (Some(group), Some(target)) => {
                    if !ignore {
                        group["now"] = Value::String(target);
                    }
                    empty(StatusCode::NO_CONTENT)
                }
                _ => not_found(),
            }
        }
        (&Method::GET, ["proxies", name, "delay"]) => {
            let delay = st
                .proxies
                .get(*name)
                .and_then(|p| p["history"].as_array()?.last()?.get("delay")?.as_u64());
            match delay {
                Some(d) => json_response(StatusCode::OK, json!({ "delay": d })),
                None => json_response(StatusCode::GATEWAY_TIMEOUT, json!({ "message": "Timeout" })),
            }
        }
        (&Method::GET, ["connections"]) => json_response(
            StatusCode::OK,
            json!({
                "uploadTotal": st.upload_total,
                "downloadTotal": st.download_total,
                "connections": if st.connections.is_empty() { Value::Null } else { Value::Array(st.connections.clone()) },
            }),
        ),
        (&Method::DELETE, ["connections"]) => {
            st.connections.clear();
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::DELETE, ["connections", id]) => {
            st.connections.retain(|c| c["id"] != *id);
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::GET, ["configs"]) => json_response(StatusCode::OK, st.configs.clone()),
        (&Method::PATCH, ["configs"]) => {
            if let (Some(cfg), Some(patch)) = (st.configs.as_object_mut(), body.as_object()) {
                for (k, v) in patch {
                    cfg.insert(k.clone(), v.clone());
                }
            }
            empty(StatusCode::NO_CONTENT)
        }
        _ => not_found(),
    };
    Ok(resp)
}

fn upgrade_traffic(
    mut req: Request<Body>,
    state: Arc<Mutex<EngineState>>,
    sockets: Arc<AtomicUsize>,
) -> Response<Body> {
    let key = match req.headers().get("sec-websocket-key") {
        Some(k) => k.as_bytes().to_vec(),
        None => return empty(StatusCode::BAD_REQUEST),
    };
    let accept = tungstenite::handshake::derive_accept_key(&key);

    tokio::spawn(async move {
        let Ok(upgraded) = hyper::upgrade::on(&mut req).await else {
            return;
        };
        sockets.fetch_add(1, Ordering::SeqCst);
        let mut ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        loop {
            let frame = state.lock().unwrap().traffic;
            if let Some((up, down)) = frame {
                let text = json!({ "up": up, "down": down }).to_string();
                if ws.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept)
        .body(Body::empty())
        .unwrap()
}

fn json_response(status: StatusCode, v: Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(v.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    resp
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

fn not_found() -> Response<Body> {
    json_response(StatusCode::NOT_FOUND, json!({ "message": "resource not found" }))
}

/// Accepts TCP connections and drops them, so every WebSocket handshake fails.
pub struct DroppingListener {
    pub addr: SocketAddr,
    pub accepts: Arc<AtomicUsize>,
}

impl DroppingListener {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        Self { addr, accepts }
    }

    pub fn count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// Polls `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
