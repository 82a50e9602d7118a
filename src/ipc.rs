//! Loopback HTTP command surface for the UI.
//!
//! Every response is a JSON envelope `{success, data?, error?, kind?}`.
//! Events are polled with `GET /events?since=<seq>`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::CommandError;
use crate::publisher::Core;

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    config_path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct SwitchRequest {
    group: String,
    node: String,
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

/// Binds the command server. The returned future serves until `shutdown`
/// is cancelled.
pub fn bind(
    core: Arc<Core>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let core = core.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, core.clone()))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local = server.local_addr();
    log::info!("[IPC] Listening on http://{}", local);
    let serve = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
    Ok((local, serve))
}

async fn handle(req: Request<Body>, core: Arc<Core>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return Ok(failure(StatusCode::BAD_REQUEST, e.to_string(), "BadRequest")),
    };
    log::debug!("[IPC] {} {}", method, path);

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/state") => success(core.state()),
        (&Method::GET, "/events") => {
            let since = query.get("since").and_then(|s| s.parse().ok()).unwrap_or(0);
            success(core.events().since(since))
        }
        (&Method::POST, "/start") => match parse_optional::<StartRequest>(&body) {
            Ok(r) => reply(core.start(r.config_path).await),
            Err(resp) => resp,
        },
        (&Method::POST, "/stop") => reply(core.stop().await),
        (&Method::POST, "/restart") => reply(core.restart().await),
        (&Method::POST, "/switch") => match parse::<SwitchRequest>(&body) {
            Ok(r) => reply(core.switch_node(&r.group, &r.node).await),
            Err(resp) => resp,
        },
        (&Method::GET, "/system-proxy") => reply(core.proxy_status().await),
        (&Method::POST, "/system-proxy") => match parse::<ToggleRequest>(&body) {
            Ok(r) => reply(core.toggle_system_proxy(r.enabled).await),
            Err(resp) => resp,
        },
        (&Method::GET, "/delay") => match query.get("node") {
            Some(node) => reply(core.test_delay(node).await),
            None => failure(StatusCode::BAD_REQUEST, "missing ?node=".into(), "BadRequest"),
        },
        (&Method::DELETE, "/connections") => reply(core.close_all().await),
        (&Method::DELETE, p) if p.starts_with("/connections/") => {
            let id = decode(&p["/connections/".len()..]);
            reply(core.close_connection(&id).await)
        }
        (&Method::GET, "/proxies") => reply(core.proxies().await),
        (&Method::GET, "/config-order") => success(core.config_order().await),
        (&Method::GET, "/configs") => reply(core.live_config().await),
        (&Method::GET, "/version") => reply(core.engine_version().await),
        (&Method::PATCH, "/configs") => match parse::<Value>(&body) {
            Ok(patch) => reply(core.patch_config(patch).await),
            Err(resp) => resp,
        },
        (&Method::GET, "/tray") => success(core.tray_menu()),
        (&Method::POST, p) if p.starts_with("/tray/") => {
            let id = decode(&p["/tray/".len()..]);
            reply(core.activate_tray_item(&id).await)
        }
        _ => failure(StatusCode::NOT_FOUND, format!("no route for {method} {path}"), "NotFound"),
    };
    Ok(resp)
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response<Body>> {
    serde_json::from_slice(body)
        .map_err(|e| failure(StatusCode::BAD_REQUEST, format!("invalid body: {e}"), "BadRequest"))
}

fn parse_optional<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, Response<Body>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse(body)
}

fn reply<T: Serialize>(result: Result<T, CommandError>) -> Response<Body> {
    match result {
        Ok(data) => success(data),
        Err(e) => {
            let status = match &e {
                CommandError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                CommandError::ControlPlane(_) => StatusCode::BAD_GATEWAY,
                CommandError::UnknownMenuItem(_) => StatusCode::NOT_FOUND,
                CommandError::NotRunning => StatusCode::CONFLICT,
                CommandError::Config(_) | CommandError::Start(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CommandError::SystemProxy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            log::warn!("[IPC] Command failed: {}", e);
            failure(status, e.to_string(), e.kind())
        }
    }
}

fn success<T: Serialize>(data: T) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &Envelope {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        },
    )
}

fn failure(status: StatusCode, error: String, kind: &'static str) -> Response<Body> {
    json_response(
        status,
        &Envelope::<()> {
            success: false,
            data: None,
            error: Some(error),
            kind: Some(kind),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, envelope: &Envelope<T>) -> Response<Body> {
    let body = serde_json::to_string(envelope).unwrap_or_else(|e| {
        format!(r#"{{"success":false,"error":"serialization failed: {e}"}}"#)
    });
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json; charset=utf-8"),
    );
    resp
}
