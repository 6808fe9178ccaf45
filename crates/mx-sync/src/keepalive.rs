//! The fallback loop entered whenever a `/sync` poll fails.
//!
//! Repeatedly pokes the cheap unauthenticated `/versions` endpoint with a
//! 5 s budget, doubling backoff capped at 32 s (2, 4, 8, 16, 32, 32, …).
//! The attempt counter is carried across invocations so consecutive sync
//! failures keep climbing the backoff instead of restarting at 2 s — but a
//! sleep that overran its planned duration by more than double resets it to
//! 1, treating the overrun as a process-suspension wake-up.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::Method;
use tracing::debug;

use mx_http::HttpGateway;
use mx_timer::RealtimeTimer;

use crate::deadline::await_with_deadline;

const PROBE_BUDGET_MS: i64 = 5_000;
const MAX_BACKOFF_STEP: u32 = 5; // 2000 * 2^4 = 32000

/// Carries the backoff step across repeated keep-alive invocations.
#[derive(Default)]
pub struct KeepAliveState {
    attempt: AtomicU32,
}

impl KeepAliveState {
    pub fn new() -> Self {
        Self { attempt: AtomicU32::new(1) }
    }

    fn backoff_ms(&self) -> u64 {
        let step = self.attempt.load(Ordering::SeqCst).min(MAX_BACKOFF_STEP + 1).saturating_sub(1).min(MAX_BACKOFF_STEP);
        2_000u64 * 2u64.pow(step)
    }

    fn note_suspension_if_overrun(&self, planned: Duration, actual: Duration) {
        if actual > planned * 2 {
            debug!(?planned, ?actual, "keep-alive sleep overran — treating as resume from suspension");
            self.attempt.store(1, Ordering::SeqCst);
        }
    }

    fn bump(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
    }

    /// Resets the backoff to its first step — called once `/sync` resumes
    /// cleanly so the next failure starts fresh.
    pub fn reset(&self) {
        self.attempt.store(1, Ordering::SeqCst);
    }
}

/// Blocks until `GET /versions` succeeds. Does not retry forever blindly —
/// every failed probe bumps the shared backoff state before sleeping again.
pub async fn run_until_reachable(gateway: &HttpGateway, timer: &RealtimeTimer, state: &KeepAliveState) {
    loop {
        let planned = Duration::from_millis(state.backoff_ms());
        let start = tokio::time::Instant::now();
        tokio::time::sleep(planned).await;
        state.note_suspension_if_overrun(planned, start.elapsed());

        let url = gateway.form_url("/versions", &[], Some("/_matrix/client"));
        let pending = gateway.request::<()>(Method::GET, url, vec![], None);
        match await_with_deadline(timer, pending, PROBE_BUDGET_MS).await {
            Ok(_) => return,
            Err(err) => {
                debug!(%err, "keep-alive probe failed");
                state.bump();
            }
        }
    }
}
