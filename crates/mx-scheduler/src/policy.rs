//! The two default policies a [`crate::Scheduler`] is constructed with —
//! callers are free to supply their own selector and retry closures instead.

use mx_core::MxError;

use crate::ticket::SchedulerEvent;

/// Message-type events go to the `"message"` queue; everything else is sent
/// concurrently (no queue, null selector result).
pub fn queue_messages<E: SchedulerEvent>(event: &E) -> Option<String> {
    if event.event_type() == "m.room.message" {
        Some("message".to_string())
    } else {
        None
    }
}

/// Rate-limit errors wait exactly the server-supplied duration. Otherwise
/// `1000 * 2^attempts` ms, giving up (`-1`) once `attempts > 4`.
pub fn retry_backoff_ratelimit<E>(_event: &E, attempts: u32, err: &MxError) -> i64 {
    if let Some(retry_after_ms) = err.retry_after_ms() {
        return retry_after_ms as i64;
    }
    if attempts > 4 {
        return -1;
    }
    1000i64 * 2i64.pow(attempts)
}
