//! Races a [`PendingResult`] against a [`RealtimeTimer`]-armed deadline.
//!
//! Shared by the main poll loop (`pollTimeout + BUFFER_PERIOD`), the
//! keep-alive probe (fixed 5 s budget), and peek's `/events` long-poll.

use mx_core::{MxError, Result};
use mx_http::PendingResult;
use mx_timer::RealtimeTimer;
use tokio::sync::oneshot;

pub async fn await_with_deadline<T: Send + 'static>(
    timer: &RealtimeTimer,
    mut pending: PendingResult<T>,
    deadline_ms: i64,
) -> Result<T> {
    let (tx, rx) = oneshot::channel::<()>();
    let key = timer.schedule(deadline_ms, move || {
        let _ = tx.send(());
    });

    tokio::select! {
        res = &mut pending => {
            timer.cancel(key);
            res
        }
        _ = rx => {
            pending.cancel();
            pending.await
        }
    }
}

/// `true` for the error kinds the main loop treats the same as a network
/// failure — local timeout included, since a wedged long-poll is
/// indistinguishable from a dead connection to the caller.
pub fn is_transport_failure(err: &MxError) -> bool {
    matches!(err, MxError::LocalTimeout(_) | MxError::Network(_) | MxError::HttpStatus { .. } | MxError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_http::{GatewayConfig, HttpGateway};
    use reqwest::Method;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn deadline_cancels_a_slow_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let timer = RealtimeTimer::new();
        let gw = HttpGateway::new(
            GatewayConfig {
                base_url: server.uri(),
                access_token: Some("tok".to_string()),
                ..Default::default()
            },
            timer.clone(),
        );
        let url = gw.form_url("/slow", &[], None);
        let pending = gw.authorized_request::<()>(Method::GET, url, vec![], None);
        let err = await_with_deadline(&timer, pending, 20).await.unwrap_err();
        assert!(matches!(err, MxError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_does_not_fire_on_a_fast_reply() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/fast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let timer = RealtimeTimer::new();
        let gw = HttpGateway::new(
            GatewayConfig {
                base_url: server.uri(),
                access_token: Some("tok".to_string()),
                ..Default::default()
            },
            timer.clone(),
        );
        let url = gw.form_url("/fast", &[], None);
        let pending = gw.authorized_request::<()>(Method::GET, url, vec![], None);
        let reply = await_with_deadline(&timer, pending, 5000).await.unwrap();
        assert_eq!(reply.data["ok"], true);
    }
}
