use std::time::Duration;

use http::{Method, StatusCode};
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::controller::types::{
    ConnectionsSnapshot, Delay, DelayResponse, ProxiesResponse, ProxyInfo, ProxyTopology,
    VersionResponse,
};
use crate::error::ControlPlaneError;
use crate::settings::Settings;

/// Thin client for the engine's loopback REST API.
///
/// Every call is bounded by a timeout and never retried here; pollers and
/// user-facing commands decide for themselves what a failure means.
#[derive(Clone)]
pub struct ControllerClient {
    http: Client<HttpConnector>,
    base: String,
    secret: Option<String>,
    timeout: Duration,
}

impl ControllerClient {
    pub fn new(base: impl Into<String>, secret: Option<String>, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        Self {
            http: Client::builder().build(connector),
            base: base.into().trim_end_matches('/').to_string(),
            secret,
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.controller_url(),
            settings.secret.clone(),
            settings.request_timeout(),
        )
    }

    /// WebSocket URL of the traffic stream.
    pub fn traffic_url(&self) -> String {
        let ws = match self.base.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!("ws://{}", self.base.trim_start_matches("http://")),
        };
        format!("{ws}/traffic")
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub async fn version(&self) -> Result<String, ControlPlaneError> {
        let v: VersionResponse = self.get_json("/version").await?;
        Ok(v.version)
    }

    pub async fn list_proxies(&self) -> Result<ProxyTopology, ControlPlaneError> {
        let resp: ProxiesResponse = self.get_json("/proxies").await?;
        Ok(ProxyTopology::from_map(resp.proxies))
    }

    pub async fn get_proxy(&self, name: &str) -> Result<ProxyInfo, ControlPlaneError> {
        let mut info: ProxyInfo = self.get_json(&format!("/proxies/{}", encode(name))).await?;
        if info.name.is_empty() {
            info.name = name.to_string();
        }
        Ok(info)
    }

    /// Selects `node` in `group` and reads the group back to confirm it.
    pub async fn switch_node(&self, group: &str, node: &str) -> Result<(), ControlPlaneError> {
        let path = format!("/proxies/{}", encode(group));
        self.send(Method::PUT, &path, Some(json!({ "name": node })), self.timeout)
            .await?;

        let actual = self.get_proxy(group).await?.now.unwrap_or_default();
        if actual != node {
            return Err(ControlPlaneError::SwitchVerificationFailed {
                group: group.to_string(),
                requested: node.to_string(),
                actual,
            });
        }
        log::info!("[Controller] Switched {} -> {}", group, node);
        Ok(())
    }

    pub async fn test_delay(
        &self,
        node: &str,
        test_url: &str,
        timeout_ms: u64,
    ) -> Result<Delay, ControlPlaneError> {
        let path = format!(
            "/proxies/{}/delay?url={}&timeout={}",
            encode(node),
            encode(test_url),
            timeout_ms
        );
        // The engine answers only after its own delay timeout.
        let budget = self.timeout.max(Duration::from_millis(timeout_ms.saturating_add(1_000)));
        let (status, body) = self.raw(Method::GET, &path, None, budget).await?;

        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            return Ok(Delay::Timeout);
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        let resp: DelayResponse = serde_json::from_slice(&body)?;
        let delay = resp
            .delay
            .and_then(|n| n.as_u64())
            .and_then(|ms| u32::try_from(ms).ok())
            .map(Delay::from_millis)
            .unwrap_or(Delay::Timeout);
        Ok(delay)
    }

    pub async fn list_connections(&self) -> Result<ConnectionsSnapshot, ControlPlaneError> {
        self.get_json("/connections").await
    }

    pub async fn close_connection(&self, id: &str) -> Result<(), ControlPlaneError> {
        let path = format!("/connections/{}", encode(id));
        self.send(Method::DELETE, &path, None, self.timeout).await?;
        Ok(())
    }

    pub async fn close_all(&self) -> Result<(), ControlPlaneError> {
        self.send(Method::DELETE, "/connections", None, self.timeout)
            .await?;
        Ok(())
    }

    pub async fn get_configs(&self) -> Result<Value, ControlPlaneError> {
        self.get_json("/configs").await
    }

    /// Applies a partial live config, e.g. `{"mode": "global"}`.
    pub async fn patch_configs(&self, patch: Value) -> Result<(), ControlPlaneError> {
        self.send(Method::PATCH, "/configs", Some(patch), self.timeout)
            .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlPlaneError> {
        let body = self.send(Method::GET, path, None, self.timeout).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Like `raw`, but any non-2xx status is an error.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        budget: Duration,
    ) -> Result<Bytes, ControlPlaneError> {
        let (status, bytes) = self.raw(method, path, body, budget).await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(bytes)
    }

    async fn raw(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        budget: Duration,
    ) -> Result<(StatusCode, Bytes), ControlPlaneError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base, path));
        if let Some(secret) = &self.secret {
            builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {secret}"));
        }
        let req = match body {
            Some(v) => builder
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string())),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| ControlPlaneError::Unreachable(format!("invalid request: {e}")))?;

        let exchange = async {
            let resp = self.http.request(req).await?;
            let status = resp.status();
            let bytes = hyper::body::to_bytes(resp.into_body()).await?;
            Ok::<_, ControlPlaneError>((status, bytes))
        };
        tokio::time::timeout(budget, exchange)
            .await
            .map_err(|_| ControlPlaneError::Timeout)?
    }
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

fn status_error(status: StatusCode, body: &[u8]) -> ControlPlaneError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    ControlPlaneError::Status {
        code: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeEngine, closed_port};

    fn client(engine: &FakeEngine) -> ControllerClient {
        ControllerClient::new(engine.url(), None, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn lists_groups_from_the_engine() {
        let engine = FakeEngine::start().await;
        engine.add_group("PROXY", "Selector", &["x", "y"], "x");
        engine.add_node("x", Some(120));
        engine.add_node("y", None);

        let topo = client(&engine).list_proxies().await.unwrap();
        assert_eq!(topo.groups.len(), 1);
        assert_eq!(topo.groups[0].now.as_deref(), Some("x"));
        assert_eq!(topo.proxies_by_name["x"].last_delay(), Some(Delay::Millis(120)));
    }

    #[tokio::test]
    async fn switch_is_verified_by_reading_back() {
        let engine = FakeEngine::start().await;
        engine.add_group("MAIN", "Selector", &["x", "y"], "x");
        let c = client(&engine);

        c.switch_node("MAIN", "y").await.unwrap();
        assert_eq!(engine.now_of("MAIN").as_deref(), Some("y"));

        engine.set_ignore_switch(true);
        let err = c.switch_node("MAIN", "x").await.unwrap_err();
        match err {
            ControlPlaneError::SwitchVerificationFailed { actual, requested, .. } => {
                assert_eq!(actual, "y");
                assert_eq!(requested, "x");
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delay_zero_and_engine_timeouts_are_timeouts() {
        let engine = FakeEngine::start().await;
        engine.add_node("fast", Some(42));
        engine.add_node("zero", Some(0));
        engine.add_node("dead", None);
        let c = client(&engine);

        let url = "http://www.gstatic.com/generate_204";
        assert_eq!(c.test_delay("fast", url, 500).await.unwrap(), Delay::Millis(42));
        assert_eq!(c.test_delay("zero", url, 500).await.unwrap(), Delay::Timeout);
        assert_eq!(c.test_delay("dead", url, 500).await.unwrap(), Delay::Timeout);
        assert_eq!(c.test_delay("fast", url, u64::MAX).await.unwrap(), Delay::Millis(42));
    }

    #[tokio::test]
    async fn connections_can_be_listed_and_closed() {
        let engine = FakeEngine::start().await;
        engine.set_connections(&["a", "b"], 100, 200);
        let c = client(&engine);

        let snap = c.list_connections().await.unwrap();
        assert_eq!(snap.items().len(), 2);
        assert_eq!(snap.download_total, 200);

        c.close_connection("a").await.unwrap();
        assert_eq!(c.list_connections().await.unwrap().items().len(), 1);
        c.close_all().await.unwrap();
        assert!(c.list_connections().await.unwrap().items().is_empty());
    }

    #[tokio::test]
    async fn live_config_can_be_read_and_patched() {
        let engine = FakeEngine::start().await;
        let c = client(&engine);

        assert_eq!(c.version().await.unwrap(), "fake");
        assert_eq!(c.get_configs().await.unwrap()["mode"], "rule");
        c.patch_configs(json!({ "mode": "global" })).await.unwrap();
        assert_eq!(engine.configs()["mode"], "global");
    }

    #[tokio::test]
    async fn missing_engine_is_unreachable() {
        let c = ControllerClient::new(
            format!("http://127.0.0.1:{}", closed_port()),
            None,
            Duration::from_secs(1),
        );
        assert!(matches!(
            c.list_proxies().await.unwrap_err(),
            ControlPlaneError::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn unknown_group_reports_status() {
        let engine = FakeEngine::start().await;
        let err = client(&engine).get_proxy("nope").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Status { code: 404, .. }));
    }

    #[test]
    fn traffic_url_follows_the_base() {
        let c = ControllerClient::new("http://127.0.0.1:9090/", None, Duration::from_secs(1));
        assert_eq!(c.traffic_url(), "ws://127.0.0.1:9090/traffic");
    }
}
