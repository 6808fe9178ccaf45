//! Read-only observation of a room the user has not joined.
//!
//! `peek` issues an initial sync for the room, then polls `/events?from=…`
//! in a loop until [`SyncEngine::stop_peeking`] nulls the tracked target.
//! The in-flight poll is allowed to settle; its continuation checks the
//! target again before scheduling the next one, so a call racing the
//! final poll never starts a request that would just be discarded.

use reqwest::Method;
use serde_json::Value;

use mx_core::{BusMessage, BusTopic, EventBus, EventMapper, Result, RoomModel, RoomStore};

use crate::deadline::await_with_deadline;
use crate::engine::SyncEngine;

const EVENTS_POLL_TIMEOUT_MS: i64 = 30_000;
const EVENTS_DEADLINE_MS: i64 = EVENTS_POLL_TIMEOUT_MS + 10_000;

impl SyncEngine {
    /// Begins peeking `room_id`. Returns once the loop has stopped — either
    /// because `stop_peeking` was called or a request errored.
    pub async fn peek(&self, room_id: &str) -> Result<()> {
        *self.peek_target.lock().unwrap() = Some(room_id.to_string());

        let initial_url = self.gateway().form_url(&format!("/rooms/{room_id}/initialSync"), &[], None);
        let pending = self.gateway().authorized_request::<()>(Method::GET, initial_url, vec![], None);
        let reply = await_with_deadline(self.timer(), pending, EVENTS_DEADLINE_MS).await?;

        self.apply_initial_room_sync(room_id, &reply.data).await;
        let mut from = reply.data["messages"]["end"].as_str().unwrap_or_default().to_string();

        loop {
            if !self.peeking(room_id) {
                return Ok(());
            }

            let url = self.gateway().form_url(
                "/events",
                &[("from", from.as_str()), ("timeout", &EVENTS_POLL_TIMEOUT_MS.to_string())],
                None,
            );
            let pending = self.gateway().authorized_request::<()>(Method::GET, url, vec![], None);
            let reply = await_with_deadline(self.timer(), pending, EVENTS_DEADLINE_MS).await?;

            // Re-checked after the await: `stop_peeking` may have nulled the
            // target while this request was outstanding.
            if !self.peeking(room_id) {
                return Ok(());
            }

            if let Some(end) = reply.data["end"].as_str() {
                from = end.to_string();
            }

            if let Some(chunk) = reply.data["chunk"].as_array() {
                for raw in chunk {
                    if raw.get("room_id").and_then(Value::as_str) != Some(room_id) {
                        continue;
                    }
                    let event = self.mapper().map(raw.clone(), Some(room_id));
                    self.bus().publish(BusTopic::Event, BusMessage::Event { event }).await;
                }
            }
        }
    }

    /// Causes `peek`'s next iteration (or its current in-flight poll's
    /// continuation) to exit without issuing another request.
    pub fn stop_peeking(&self) {
        *self.peek_target.lock().unwrap() = None;
    }

    fn peeking(&self, room_id: &str) -> bool {
        self.peek_target.lock().unwrap().as_deref() == Some(room_id)
    }

    async fn apply_initial_room_sync(&self, room_id: &str, data: &Value) {
        let (room, is_brand_new) = self.room_store().get_or_create(room_id).await;
        let state_events: Vec<Value> = data["state"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|e| self.mapper().map(e, Some(room_id)))
            .collect();
        room.set_state_events(&state_events).await;

        let timeline_events: Vec<Value> = data["messages"]["chunk"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|e| self.mapper().map(e, Some(room_id)))
            .collect();
        room.add_events_to_timeline(&timeline_events, false).await;
        room.recalculate(self.user_id()).await;

        if is_brand_new {
            self.bus().publish(BusTopic::Room(room_id.to_string()), BusMessage::RoomCreated { room_id: room_id.to_string() }).await;
        }
    }
}
