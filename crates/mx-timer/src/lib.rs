//! A process-wide facility that schedules callbacks on a wall-clock deadline.
//!
//! Entries are kept in a `Vec` sorted by `run_at`, driven by a single
//! coordinator task. A real host timer is armed for
//! `min(next_deadline - now, CHECK_PERIOD)`, so wake-on-resume latency after
//! a process suspension stays under one second even when the next scheduled
//! deadline was hours away — without polling when nothing is scheduled.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Upper bound on how long the coordinator sleeps between checks, even if no
/// timer is due sooner. Keeps the wake-on-resume guarantee bounded.
pub const CHECK_PERIOD: Duration = Duration::from_millis(1000);

/// Opaque cancellation token returned by [`RealtimeTimer::schedule`].
pub type TimerKey = u64;

/// Test-only seam for injecting a clock source. Returns milliseconds on a
/// monotonic scale (not wall-clock epoch — only deltas matter).
pub type NowFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Milliseconds since `origin`, measured through `tokio::time::Instant` so
/// that `tokio::time::pause`/`advance` in tests move this clock too — a
/// plain `std::time::Instant` or `SystemTime` would not observe either.
fn tokio_clock(origin: tokio::time::Instant) -> NowFn {
    Arc::new(move || origin.elapsed().as_millis() as i64)
}

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    key: TimerKey,
    run_at_ms: i64,
    callback: Callback,
}

enum Command {
    Schedule { key: TimerKey, delay_ms: i64, callback: Callback },
    Cancel(TimerKey),
    SetNow(NowFn),
}

/// Handle to the realtime timer's coordinator task. Cloning shares the same
/// underlying schedule — every clone can schedule and cancel.
#[derive(Clone)]
pub struct RealtimeTimer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_key: Arc<AtomicU64>,
}

impl Default for RealtimeTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeTimer {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let origin = tokio::time::Instant::now();
        tokio::spawn(coordinator_loop(cmd_rx, tokio_clock(origin)));
        Self {
            cmd_tx,
            next_key: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Schedule `callback` to run `delay_ms` from now. Negative delays clamp
    /// to zero. Returns a key that can be passed to [`Self::cancel`].
    pub fn schedule<F>(&self, delay_ms: i64, callback: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let delay_ms = delay_ms.max(0);
        // run_at is resolved by the coordinator against its own now() so that
        // a SetNow seam installed after this call still applies consistently.
        let _ = self.cmd_tx.send(Command::Schedule {
            key,
            delay_ms,
            callback: Box::new(callback),
        });
        key
    }

    /// Silent no-op if `key` is unknown or already fired.
    pub fn cancel(&self, key: TimerKey) {
        let _ = self.cmd_tx.send(Command::Cancel(key));
    }

    /// Test-only seam: replace the clock source used to resolve deadlines.
    /// `now` should return a monotonic millisecond count — deltas are all
    /// that matter, not the absolute value.
    pub fn set_now<F>(&self, now: F)
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        let _ = self.cmd_tx.send(Command::SetNow(Arc::new(now)));
    }
}

async fn coordinator_loop(mut cmd_rx: mpsc::UnboundedReceiver<Command>, initial_now: NowFn) {
    let mut entries: Vec<Entry> = Vec::new();
    let mut cancelled: HashSet<TimerKey> = HashSet::new();
    let now_fn: Mutex<NowFn> = Mutex::new(initial_now);

    loop {
        let now = { now_fn.lock().await.clone() };
        let now_ms = now();

        let sleep_for = match entries.first() {
            Some(e) => {
                let remaining = (e.run_at_ms - now_ms).max(0) as u64;
                Duration::from_millis(remaining).min(CHECK_PERIOD)
            }
            None => CHECK_PERIOD,
        };

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Schedule { key, delay_ms, callback }) => {
                        let run_at_ms = now_ms + delay_ms;
                        let idx = entries.partition_point(|e| e.run_at_ms <= run_at_ms);
                        entries.insert(idx, Entry { key, run_at_ms, callback });
                    }
                    Some(Command::Cancel(key)) => {
                        if let Some(idx) = entries.iter().position(|e| e.key == key) {
                            entries.remove(idx);
                        } else {
                            cancelled.insert(key);
                        }
                    }
                    Some(Command::SetNow(f)) => {
                        *now_fn.lock().await = f;
                    }
                    None => return, // all handles dropped
                }
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }

        // Re-arm before running callbacks so a callback that reschedules
        // itself observes a clean state, then fire everything due.
        let now_ms = { let f = now_fn.lock().await; f() };
        let due_end = entries.partition_point(|e| e.run_at_ms <= now_ms);
        if due_end == 0 {
            continue;
        }
        let due: Vec<Entry> = entries.drain(0..due_end).collect();
        for entry in due {
            if cancelled.remove(&entry.key) {
                continue;
            }
            let key = entry.key;
            let result = std::panic::catch_unwind(AssertUnwindSafe(entry.callback));
            if let Err(panic) = result {
                warn!(key, ?panic, "timer callback panicked");
            } else {
                debug!(key, "timer callback fired");
            }
        }
    }
}
