//! `HttpGateway` — a stateless façade over `reqwest`. It never retries; that
//! policy lives in `mx-scheduler` or in `mx-sync`'s keep-alive loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use mx_core::{MxError, Result};
use mx_timer::RealtimeTimer;

use crate::pending::{CancelHandle, CancelReason, PendingResult};

/// Construction-time options recognized by [`HttpGateway::new`].
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_url: String,
    pub id_base_url: Option<String>,
    pub access_token: Option<String>,
    pub extra_params: HashMap<String, String>,
    pub local_timeout_ms: Option<u64>,
    /// When set, [`Reply::into_data_only`] is the expected extraction path —
    /// kept as a flag rather than a second return type so callers opt in
    /// per call-site instead of the gateway committing to one shape globally.
    pub only_data: bool,
    pub prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            id_base_url: None,
            access_token: None,
            extra_params: HashMap::new(),
            local_timeout_ms: None,
            only_data: false,
            prefix: "/_matrix/client/r0".to_string(),
        }
    }
}

/// `{code, headers, data}` — or just `data` via [`Self::into_data_only`] when
/// the gateway was constructed with `only_data: true`.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub headers: HashMap<String, String>,
    pub data: Value,
}

impl Reply {
    pub fn into_data_only(self) -> Value {
        self.data
    }
}

pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    timer: RealtimeTimer,
    logged_out_tx: broadcast::Sender<()>,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig, timer: RealtimeTimer) -> Self {
        let (logged_out_tx, _) = broadcast::channel(8);
        Self {
            client: reqwest::Client::new(),
            config,
            timer,
            logged_out_tx,
        }
    }

    /// Subscribe to session-logged-out notifications, raised when an
    /// authorized request comes back with `M_UNKNOWN_TOKEN`.
    pub fn subscribe_logged_out(&self) -> broadcast::Receiver<()> {
        self.logged_out_tx.subscribe()
    }

    pub fn only_data(&self) -> bool {
        self.config.only_data
    }

    pub(crate) fn client_ref(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn timer_handle(&self) -> RealtimeTimer {
        self.timer.clone()
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.config.access_token.clone()
    }

    pub(crate) fn local_timeout_ms(&self) -> Option<u64> {
        self.config.local_timeout_ms
    }

    /// Builds `{base_url}{prefix}{path}?{params}` — the same templating the
    /// sync engine and upload path both rely on.
    pub fn form_url(&self, path: &str, params: &[(&str, &str)], prefix: Option<&str>) -> String {
        let prefix = prefix.unwrap_or(&self.config.prefix);
        let mut url = format!("{}{}{}", self.config.base_url.trim_end_matches('/'), prefix, path);
        if !params.is_empty() {
            let qs = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish();
            url.push('?');
            url.push_str(&qs);
        }
        url
    }

    /// `request(method, url, query, body, opts)` — JSON-by-default, no auth attached.
    pub fn request<B: Serialize + Send + 'static>(
        &self,
        method: Method,
        url: String,
        query: Vec<(String, String)>,
        body: Option<B>,
    ) -> PendingResult<Reply> {
        self.dispatch(method, url, query, body, None)
    }

    /// Same as [`Self::request`], with the access token attached via query
    /// parameter. On `M_UNKNOWN_TOKEN` this also raises the logged-out
    /// notification — the original caller still sees the rejection.
    pub fn authorized_request<B: Serialize + Send + 'static>(
        &self,
        method: Method,
        url: String,
        query: Vec<(String, String)>,
        body: Option<B>,
    ) -> PendingResult<Reply> {
        let token = self.config.access_token.clone();
        self.dispatch(method, url, query, body, token)
    }

    fn dispatch<B: Serialize + Send + 'static>(
        &self,
        method: Method,
        url: String,
        mut query: Vec<(String, String)>,
        body: Option<B>,
        access_token: Option<String>,
    ) -> PendingResult<Reply> {
        if let Some(token) = &access_token {
            query.push(("access_token".to_string(), token.clone()));
        }
        for (k, v) in &self.config.extra_params {
            query.push((k.clone(), v.clone()));
        }

        let client = self.client.clone();
        let cancel = Arc::new(CancelHandle::default());
        let (tx, rx) = oneshot::channel();
        let logged_out_tx = self.logged_out_tx.clone();
        let is_authorized = access_token.is_some();

        // one-shot: never rescheduled, but cancelled below once the request
        // settles so it doesn't linger in the timer's entry list.
        let timeout_key = self.config.local_timeout_ms.map(|timeout_ms| schedule_timeout(&self.timer, &cancel, timeout_ms));
        let timer = self.timer.clone();

        let cancel_for_task = cancel.clone();
        tokio::spawn(async move {
            let fut = execute(client, method, url, query, body);
            tokio::pin!(fut);
            let cancelled = cancel_for_task.cancelled();
            tokio::pin!(cancelled);

            let result = tokio::select! {
                r = &mut fut => r,
                err = &mut cancelled => Err(err),
            };

            if let Some(key) = timeout_key {
                timer.cancel(key);
            }

            if is_authorized {
                if let Err(MxError::UnknownToken) = &result {
                    let _ = logged_out_tx.send(());
                }
            }
            let _ = tx.send(result);
        });

        PendingResult::new(rx, cancel)
    }
}

async fn execute<B: Serialize>(
    client: reqwest::Client,
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    body: Option<B>,
) -> Result<Reply> {
    let mut req = client.request(method, &url).query(&query);
    if let Some(body) = &body {
        req = req.json(body);
    }

    let resp = req.send().await.map_err(|e| MxError::Network(e.into()))?;
    let status = resp.status().as_u16();
    let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect::<HashMap<_, _>>();

    let bytes = resp.bytes().await.map_err(|e| MxError::Network(e.into()))?;
    let data: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    if !(200..300).contains(&status) {
        let errcode = data
            .get("errcode")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let message = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let retry_after_ms = data.get("retry_after_ms").and_then(Value::as_u64);

        if errcode.is_empty() {
            return Err(MxError::HttpStatus {
                status,
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        debug!(status, errcode, "request failed");
        return Err(MxError::from_matrix_body(status, errcode, message, retry_after_ms));
    }

    Ok(Reply { code: status, headers, data })
}

pub(crate) fn schedule_timeout(timer: &RealtimeTimer, cancel: &Arc<CancelHandle>, timeout_ms: u64) -> mx_timer::TimerKey {
    let cancel = cancel.clone();
    timer.schedule(timeout_ms as i64, move || {
        cancel.trigger(CancelReason::LocalTimeout(Duration::from_millis(timeout_ms)));
    })
}

/// Cancels `old_key` (if any) and reschedules — called on every upload
/// progress tick so a slow-but-live transfer is not killed by a single
/// fixed deadline.
pub(crate) fn rearm_timeout(
    timer: &RealtimeTimer,
    cancel: &Arc<CancelHandle>,
    old_key: Option<mx_timer::TimerKey>,
    timeout_ms: u64,
) -> mx_timer::TimerKey {
    if let Some(old) = old_key {
        timer.cancel(old);
    }
    schedule_timeout(timer, cancel, timeout_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base_url: String) -> HttpGateway {
        HttpGateway::new(
            GatewayConfig {
                base_url,
                access_token: Some("tok".to_string()),
                ..Default::default()
            },
            RealtimeTimer::new(),
        )
    }

    #[test]
    fn form_url_appends_query_params() {
        let gw = gateway("https://example.org".to_string());
        let url = gw.form_url("/sync", &[("since", "s1"), ("timeout", "30000")], None);
        assert_eq!(url, "https://example.org/_matrix/client/r0/sync?since=s1&timeout=30000");
    }

    #[tokio::test]
    async fn authorized_request_returns_reply_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"next_batch": "s1"})))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        let url = gw.form_url("/sync", &[], None);
        let reply = gw
            .authorized_request::<()>(Method::GET, url, vec![], None)
            .await
            .expect("request should succeed");
        assert_eq!(reply.code, 200);
        assert_eq!(reply.data["next_batch"], "s1");
    }

    #[tokio::test]
    async fn matrix_error_body_maps_to_matrix_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "errcode": "M_LIMIT_EXCEEDED",
                "error": "too fast",
                "retry_after_ms": 500,
            })))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        let url = gw.form_url("/sync", &[], None);
        let err = gw
            .authorized_request::<()>(Method::GET, url, vec![], None)
            .await
            .expect_err("429 should surface as an error");
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_ms(), Some(500));
    }

    #[tokio::test]
    async fn unknown_token_raises_logged_out_notification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "errcode": "M_UNKNOWN_TOKEN",
                "error": "invalid token",
            })))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        let mut logged_out = gw.subscribe_logged_out();
        let url = gw.form_url("/sync", &[], None);
        let err = gw
            .authorized_request::<()>(Method::GET, url, vec![], None)
            .await
            .expect_err("unknown token should surface as an error");
        assert!(matches!(err, MxError::UnknownToken));
        assert!(logged_out.try_recv().is_ok());
    }

    #[tokio::test]
    async fn cancel_settles_pending_result_without_waiting_for_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        let url = gw.form_url("/slow", &[], None);
        let pending = gw.authorized_request::<()>(Method::GET, url, vec![], None);
        pending.cancel();
        let err = pending.await.expect_err("cancelled request should error");
        assert!(matches!(err, MxError::Cancelled));
    }
}
