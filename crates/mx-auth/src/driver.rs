//! The UIA negotiator itself.
//!
//! ```text
//! Idle ──begin, no initial data──▶ Requesting (auth=null)
//! Idle ──begin, initial data──▶ AwaitingUser(stage=next)
//! Requesting ──reply success──▶ Resolved
//! Requesting ──reply 401 with flows──▶ AwaitingUser(stage=next)
//! Requesting ──reply other error──▶ Rejected
//! AwaitingUser ──submit(authDict)──▶ Requesting
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use mx_core::{MxError, Result};

use crate::challenge::{DoRequestError, StageError, UiaChallenge};

/// Issues the protected request. A UIA challenge is reported through
/// [`DoRequestError::Uia`], not as a plain error — the driver treats it as
/// a state transition, not a failure.
#[async_trait]
pub trait AuthRequester: Send + Sync {
    async fn do_request(&self, auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError>;
}

/// Implemented by the UI layer to gather the next stage's input. Called with
/// `None` unless the previous attempt at this stage carried an error.
pub trait StageCallback: Send + Sync {
    fn start_stage(&self, login_type: &str, error: Option<StageError>);
}

impl<F: Fn(&str, Option<StageError>) + Send + Sync> StageCallback for F {
    fn start_stage(&self, login_type: &str, error: Option<StageError>) {
        (self)(login_type, error)
    }
}

struct Session {
    session_id: Option<String>,
    params: std::collections::HashMap<String, Value>,
    pending_submit: Option<oneshot::Sender<Value>>,
}

/// Drives a single UIA negotiation to resolution. Not reusable across
/// negotiations — a fresh `session` id means a fresh driver.
pub struct InteractiveAuth<R, S> {
    requester: R,
    stage_cb: S,
    initial: Option<UiaChallenge>,
    session: Mutex<Session>,
}

impl<R, S> InteractiveAuth<R, S>
where
    R: AuthRequester,
    S: StageCallback,
{
    pub fn new(requester: R, stage_cb: S, initial_auth_data: Option<UiaChallenge>) -> Self {
        Self {
            requester,
            stage_cb,
            initial: initial_auth_data,
            session: Mutex::new(Session {
                session_id: None,
                params: std::collections::HashMap::new(),
                pending_submit: None,
            }),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().unwrap().session_id.clone()
    }

    pub fn params_for(&self, stage_type: &str) -> Option<Value> {
        self.session.lock().unwrap().params.get(stage_type).cloned()
    }

    /// Resolves with the final server reply, or rejects with a terminal
    /// error. Drives `submit` round-trips internally — callers don't loop.
    pub async fn begin(&self) -> Result<Value> {
        let mut auth_dict = match self.initial.clone() {
            Some(challenge) => Some(self.await_submission(&challenge).await?),
            None => None,
        };

        loop {
            match self.call_requester(auth_dict.take()).await {
                Ok(value) => return Ok(value),
                Err(DoRequestError::Uia(challenge)) => {
                    auth_dict = Some(self.await_submission(&challenge).await?);
                }
                Err(DoRequestError::Other(err)) => return Err(err),
            }
        }
    }

    /// Supplies `{type, ...}` for the stage currently being waited on. A
    /// `submit` with no pending stage is silently ignored.
    pub fn submit(&self, auth_dict: Value) {
        let tx = self.session.lock().unwrap().pending_submit.take();
        if let Some(tx) = tx {
            let _ = tx.send(auth_dict);
        } else {
            debug!("submit called with no stage awaiting input");
        }
    }

    async fn await_submission(&self, challenge: &UiaChallenge) -> Result<Value> {
        let next_stage = challenge.next_stage()?;
        {
            let mut session = self.session.lock().unwrap();
            session.session_id = Some(challenge.session.clone());
            session.params = challenge.params.clone();
        }
        self.stage_cb.start_stage(&next_stage, challenge.stage_error());

        let (tx, rx) = oneshot::channel();
        self.session.lock().unwrap().pending_submit = Some(tx);
        let mut auth_dict = rx.await.map_err(|_| MxError::Cancelled)?;
        if let Value::Object(map) = &mut auth_dict {
            map.insert("session".to_string(), Value::String(challenge.session.clone()));
        }
        Ok(auth_dict)
    }

    /// Synchronous panics inside `doRequest` are surfaced the same way as an
    /// async rejection so the caller's error path stays uniform.
    async fn call_requester(&self, auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError>
    where
        R: 'static,
    {
        match AssertUnwindSafe(self.requester.do_request(auth_dict)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(DoRequestError::Other(MxError::Network(anyhow::anyhow!("doRequest panicked")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn flows_challenge(session: &str, completed: &[&str], stage_error: Option<(&str, &str)>) -> UiaChallenge {
        UiaChallenge {
            flows: vec![vec!["A".to_string(), "B".to_string()]],
            completed: completed.iter().map(|s| s.to_string()).collect(),
            params: HashMap::new(),
            session: session.to_string(),
            errcode: stage_error.map(|(c, _)| c.to_string()),
            error: stage_error.map(|(_, m)| m.to_string()),
        }
    }

    struct ScriptedRequester {
        calls: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl AuthRequester for ScriptedRequester {
        async fn do_request(&self, auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            match *calls {
                1 => Err(DoRequestError::Uia(flows_challenge("s1", &[], None))),
                2 => {
                    assert_eq!(auth_dict.as_ref().unwrap()["session"], "s1");
                    assert_eq!(auth_dict.as_ref().unwrap()["type"], "A");
                    Err(DoRequestError::Uia(flows_challenge("s1", &["A"], None)))
                }
                3 => {
                    assert_eq!(auth_dict.as_ref().unwrap()["session"], "s1");
                    assert_eq!(auth_dict.as_ref().unwrap()["type"], "B");
                    Ok(serde_json::json!({"ok": true}))
                }
                n => panic!("unexpected call #{n}"),
            }
        }
    }

    #[tokio::test]
    async fn two_stage_flow_resolves_with_final_reply_and_stamps_session() {
        let requester = ScriptedRequester { calls: std::sync::Mutex::new(0) };
        let started = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let started_cb = started.clone();
        let stage_cb = move |login_type: &str, error: Option<StageError>| {
            started_cb.lock().unwrap().push((login_type.to_string(), error));
        };

        let auth = std::sync::Arc::new(InteractiveAuth::new(requester, stage_cb, None));
        let auth2 = auth.clone();
        let handle = tokio::spawn(async move { auth2.begin().await });

        // Give `begin` a chance to reach the first `AwaitingUser` state.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        auth.submit(serde_json::json!({"type": "A", "x": 1}));

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        auth.submit(serde_json::json!({"type": "B", "y": 2}));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        assert_eq!(auth.session_id().as_deref(), Some("s1"));

        let calls = started.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("A".to_string(), None));
        assert_eq!(calls[1], ("B".to_string(), None));
    }

    struct ImmediateSuccessRequester;

    #[async_trait]
    impl AuthRequester for ImmediateSuccessRequester {
        async fn do_request(&self, _auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn begin_with_no_challenge_needed_resolves_without_any_stage() {
        let auth = InteractiveAuth::new(ImmediateSuccessRequester, |_: &str, _: Option<StageError>| {
            panic!("stage callback should not run when no challenge is returned")
        }, None);
        let result = auth.begin().await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    struct AlwaysOtherErrorRequester;

    #[async_trait]
    impl AuthRequester for AlwaysOtherErrorRequester {
        async fn do_request(&self, _auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError> {
            Err(DoRequestError::Other(MxError::HttpStatus { status: 500, body: "down".to_string() }))
        }
    }

    #[tokio::test]
    async fn non_uia_error_terminates_the_negotiation() {
        let auth = InteractiveAuth::new(AlwaysOtherErrorRequester, |_: &str, _: Option<StageError>| {}, None);
        let err = auth.begin().await.unwrap_err();
        assert!(matches!(err, MxError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn initial_auth_data_skips_straight_to_awaiting_user() {
        let requester = ScriptedRequesterFromInitial;
        let auth = InteractiveAuth::new(requester, |_: &str, _: Option<StageError>| {}, Some(flows_challenge("s2", &[], None)));
        let auth = std::sync::Arc::new(auth);
        let auth2 = auth.clone();
        let handle = tokio::spawn(async move { auth2.begin().await });
        tokio::task::yield_now().await;
        auth.submit(serde_json::json!({"type": "A"}));
        tokio::task::yield_now().await;
        auth.submit(serde_json::json!({"type": "B"}));
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    struct ScriptedRequesterFromInitial;

    #[async_trait]
    impl AuthRequester for ScriptedRequesterFromInitial {
        async fn do_request(&self, auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError> {
            let stage = auth_dict.as_ref().and_then(|d| d.get("type")).and_then(Value::as_str).unwrap_or_default();
            match stage {
                "A" => Err(DoRequestError::Uia(flows_challenge("s2", &["A"], None))),
                "B" => Ok(serde_json::json!({"ok": true})),
                _ => panic!("unexpected stage {stage}"),
            }
        }
    }

    struct PanicsRequester;

    #[async_trait]
    impl AuthRequester for PanicsRequester {
        async fn do_request(&self, _auth_dict: Option<Value>) -> std::result::Result<Value, DoRequestError> {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn synchronous_panic_surfaces_as_a_uniform_error() {
        let auth = InteractiveAuth::new(PanicsRequester, |_: &str, _: Option<StageError>| {}, None);
        let err = auth.begin().await.unwrap_err();
        assert!(matches!(err, MxError::Network(_)));
    }

    #[test]
    fn no_incomplete_flows_is_surfaced_when_all_stages_completed() {
        let challenge = flows_challenge("s3", &["A", "B"], None);
        assert!(matches!(challenge.next_stage(), Err(MxError::NoIncompleteFlows)));
    }

    #[test]
    fn stage_error_is_only_some_when_last_reply_carried_one() {
        let clean = flows_challenge("s4", &[], None);
        assert!(clean.stage_error().is_none());
        let errored = flows_challenge("s4", &[], Some(("M_FORBIDDEN", "bad password")));
        assert_eq!(
            errored.stage_error(),
            Some(StageError {
                errcode: Some("M_FORBIDDEN".to_string()),
                error: Some("bad password".to_string()),
            })
        );
    }
}
