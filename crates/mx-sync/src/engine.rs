//! The long-poll `/sync` conversation itself.
//!
//! `SyncEngine::run` never returns to the caller with an error — failures
//! are reflected through [`SyncState::Error`] and recovered from internally
//! via the keep-alive loop in [`crate::keepalive`]. The only way the loop
//! exits on its own terms is [`SyncEngine::stop`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use mx_core::{
    sync_filter_cache_key, BusMessage, BusTopic, EventBus, EventMapper, FilterDefinition, MxError, Result, RoomModel,
    RoomStore, SyncState, SyncToken,
};
use mx_http::{HttpGateway, PendingResult};
use mx_timer::RealtimeTimer;

use crate::deadline::await_with_deadline;
use crate::filter::{FilterIdCache, ResolvedFilter};
use crate::keepalive::{run_until_reachable, KeepAliveState};

/// Client-side hard deadline added on top of the server's own long-poll
/// `timeout` — keeps a wedged connection from hanging the loop forever.
const BUFFER_PERIOD_MS: i64 = 80_000;

/// Construction-time options the sync engine recognizes.
#[derive(Clone, Debug)]
pub struct SyncEngineConfig {
    pub user_id: String,
    pub is_guest: bool,
    pub poll_timeout_ms: u64,
    pub initial_sync_limit: u32,
    pub lazy_load_members: bool,
    /// Accepted for parity with the construction-time option set; resolving
    /// invite-only members to profiles needs a profile-store collaborator
    /// this spec does not define an interface for, so invites are applied
    /// as-is regardless of this flag. See `DESIGN.md`.
    pub resolve_invites_to_profiles: bool,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            is_guest: false,
            poll_timeout_ms: 30_000,
            initial_sync_limit: 20,
            lazy_load_members: true,
            resolve_invites_to_profiles: false,
        }
    }
}

pub struct SyncEngine {
    gateway: Arc<HttpGateway>,
    timer: RealtimeTimer,
    room_store: Arc<dyn RoomStore>,
    bus: Arc<dyn EventBus>,
    mapper: Arc<dyn EventMapper>,
    filter_cache: Arc<dyn FilterIdCache>,
    config: SyncEngineConfig,

    state: Mutex<SyncState>,
    since_token: Mutex<Option<SyncToken>>,
    /// The `filter` query value to send with `/sync` — an id or an inline
    /// JSON body, resolved once by `prepare` before the main loop starts.
    resolved_filter: Mutex<String>,
    has_completed_first_sync: AtomicBool,
    stopped: AtomicBool,
    keepalive: KeepAliveState,
    /// `Some(room_id)` while `peek` is active; nulled by `stop_peeking` —
    /// see `crate::peek`.
    pub(crate) peek_target: Mutex<Option<String>>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<HttpGateway>,
        timer: RealtimeTimer,
        room_store: Arc<dyn RoomStore>,
        bus: Arc<dyn EventBus>,
        mapper: Arc<dyn EventMapper>,
        filter_cache: Arc<dyn FilterIdCache>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            gateway,
            timer,
            room_store,
            bus,
            mapper,
            filter_cache,
            config,
            state: Mutex::new(SyncState::Initial),
            since_token: Mutex::new(None),
            resolved_filter: Mutex::new(String::new()),
            has_completed_first_sync: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            keepalive: KeepAliveState::new(),
            peek_target: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap()
    }

    pub fn since_token(&self) -> Option<SyncToken> {
        self.since_token.lock().unwrap().clone()
    }

    /// Stops the loop after its current iteration settles. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn gateway(&self) -> &HttpGateway {
        &self.gateway
    }

    pub(crate) fn timer(&self) -> &RealtimeTimer {
        &self.timer
    }

    pub(crate) fn bus(&self) -> &dyn EventBus {
        self.bus.as_ref()
    }

    pub(crate) fn mapper(&self) -> &dyn EventMapper {
        self.mapper.as_ref()
    }

    pub(crate) fn room_store(&self) -> &dyn RoomStore {
        self.room_store.as_ref()
    }

    pub(crate) fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// Drives the long-poll conversation until [`Self::stop`] is called.
    /// Never surfaces a server/transport error to the caller — see module docs.
    pub async fn run(&self) {
        if let Err(err) = self.prepare().await {
            warn!(%err, "sync preconditions failed; entering error state immediately");
            self.set_state(SyncState::Error, Some(err.to_string())).await;
            run_until_reachable(&self.gateway, &self.timer, &self.keepalive).await;
        }

        // While recovering, a fresh `/sync` attempt races the keep-alive
        // probe instead of waiting on it — a wedged request must not hold
        // the loop hostage once the server is known reachable again.
        let mut recovering = false;
        while !self.is_stopped() {
            let result = if recovering { self.poll_with_keepalive_race().await } else { self.poll_once().await };
            match result {
                Ok(reply) => {
                    recovering = false;
                    self.keepalive.reset();
                    if let Err(err) = self.handle_reply(reply).await {
                        warn!(%err, "failed to apply sync reply; treating as a sync failure");
                        self.set_state(SyncState::Error, Some(err.to_string())).await;
                        recovering = true;
                    }
                }
                Err(err) => {
                    debug!(%err, "sync poll failed");
                    self.set_state(SyncState::Error, Some(err.to_string())).await;
                    recovering = true;
                }
            }
        }
        self.set_state(SyncState::Stopped, None).await;
    }

    async fn set_state(&self, state: SyncState, error: Option<String>) {
        *self.state.lock().unwrap() = state;
        self.bus.publish(BusTopic::Sync, BusMessage::SyncStateChanged { state, error }).await;
    }

    /// Fetch push rules (skipped for guests) and resolve the sync filter.
    async fn prepare(&self) -> Result<()> {
        if !self.config.is_guest {
            let url = self.gateway.form_url("/pushrules/", &[], None);
            match self.gateway.authorized_request::<()>(Method::GET, url, vec![], None).await {
                Ok(_) => debug!("push rules fetched"),
                Err(err) => warn!(%err, "failed to fetch push rules; continuing without them"),
            }
        }

        let mut filter = FilterDefinition::new();
        filter.set_timeline_limit(self.config.initial_sync_limit).set_lazy_load_members(self.config.lazy_load_members);

        if self.config.is_guest {
            *self.resolved_filter.lock().unwrap() = ResolvedFilter::Inline(filter.to_json().to_string()).query_value().to_string();
            return Ok(());
        }

        let cache_key = sync_filter_cache_key(&self.config.user_id);
        if let Some(id) = self.filter_cache.get(&cache_key).await {
            *self.resolved_filter.lock().unwrap() = id;
            return Ok(());
        }

        let url = self.gateway.form_url(&format!("/user/{}/filter", self.config.user_id), &[], None);
        let reply = self
            .gateway
            .authorized_request(Method::POST, url, vec![], Some(filter.to_json()))
            .await?;
        let filter_id = reply
            .data
            .get("filter_id")
            .and_then(Value::as_str)
            .ok_or_else(|| MxError::HttpStatus { status: reply.code, body: "missing filter_id".to_string() })?
            .to_string();
        self.filter_cache.set(&cache_key, filter_id.clone()).await;
        *self.resolved_filter.lock().unwrap() = filter_id;
        Ok(())
    }

    fn build_poll_request(&self) -> (PendingResult<mx_http::Reply>, i64) {
        let filter = self.resolved_filter.lock().unwrap().clone();
        let since = self.since_token();
        let timeout_ms = self.config.poll_timeout_ms;

        let mut query = vec![
            ("filter".to_string(), filter),
            ("timeout".to_string(), timeout_ms.to_string()),
        ];
        if let Some(token) = &since {
            query.push(("since".to_string(), token.as_str().to_string()));
        }

        let url = self.gateway.form_url("/sync", &[], None);
        let pending = self.gateway.authorized_request::<()>(Method::GET, url, query, None);
        let deadline_ms = timeout_ms as i64 + BUFFER_PERIOD_MS;
        (pending, deadline_ms)
    }

    async fn poll_once(&self) -> Result<mx_http::Reply> {
        let (pending, deadline_ms) = self.build_poll_request();
        await_with_deadline(&self.timer, pending, deadline_ms).await
    }

    /// Same as [`Self::poll_once`], but run while recovering from a prior
    /// failure: a fresh `/sync` attempt races the keep-alive reachability
    /// probe. If keep-alive proves the server reachable again while that
    /// attempt is still outstanding, it is aborted and a new one starts —
    /// a wedged request cannot hold the loop once reachability is known.
    async fn poll_with_keepalive_race(&self) -> Result<mx_http::Reply> {
        loop {
            let (mut pending, deadline_ms) = self.build_poll_request();
            let (deadline_tx, mut deadline_rx) = oneshot::channel::<()>();
            let deadline_key = self.timer.schedule(deadline_ms, move || {
                let _ = deadline_tx.send(());
            });

            tokio::select! {
                res = &mut pending => {
                    self.timer.cancel(deadline_key);
                    return res;
                }
                _ = &mut deadline_rx => {
                    pending.cancel();
                    return pending.await;
                }
                _ = run_until_reachable(&self.gateway, &self.timer, &self.keepalive) => {
                    debug!("keep-alive probe succeeded while the sync request was still outstanding; aborting it");
                    self.timer.cancel(deadline_key);
                    pending.cancel();
                    let _ = pending.await;
                }
            }
        }
    }

    async fn handle_reply(&self, reply: mx_http::Reply) -> Result<()> {
        let data = reply.data;
        let next_batch = data
            .get("next_batch")
            .and_then(Value::as_str)
            .ok_or_else(|| MxError::HttpStatus { status: reply.code, body: "missing next_batch".to_string() })?
            .to_string();

        // Store before dispatching a single event from this batch — a
        // poison event downstream cannot cause the batch to be re-fetched.
        *self.since_token.lock().unwrap() = Some(SyncToken(next_batch));

        self.emit_presence(&data).await;

        if let Some(invites) = data["rooms"]["invite"].as_object() {
            for (room_id, section) in invites {
                self.process_invite(room_id, section).await;
            }
        }
        if let Some(joins) = data["rooms"]["join"].as_object() {
            for (room_id, section) in joins {
                self.process_join(room_id, section).await;
            }
        }
        if let Some(leaves) = data["rooms"]["leave"].as_object() {
            for (room_id, section) in leaves {
                self.process_leave(room_id, section).await;
            }
        }

        let first = !self.has_completed_first_sync.swap(true, Ordering::SeqCst);
        if first {
            self.set_state(SyncState::Prepared, None).await;
        }
        self.set_state(SyncState::Syncing, None).await;
        Ok(())
    }

    /// No `UserModel` collaborator is in scope (§6.1 only names
    /// `RoomModel`/`EventMapper`), so presence is mapped and published
    /// without the look-up-or-create-a-user-model step the design notes
    /// describe — the caller's bus subscriber owns that.
    async fn emit_presence(&self, data: &Value) {
        let Some(events) = data["presence"]["events"].as_array() else { return };
        for raw in events {
            let sender = raw.get("sender").and_then(Value::as_str).unwrap_or_default().to_string();
            let event = self.mapper.map(raw.clone(), None);
            self.bus.publish(BusTopic::Event, BusMessage::Presence { user_id: sender, event }).await;
        }
    }

    async fn process_invite(&self, room_id: &str, section: &Value) {
        let (room, is_brand_new) = self.room_store.get_or_create(room_id).await;
        let invite_state = json_array(&section["invite_state"]["events"]);
        let mapped: Vec<Value> = invite_state.iter().map(|e| self.mapper.map(e.clone(), Some(room_id))).collect();
        room.set_state_events(&mapped).await;
        room.recalculate(&self.config.user_id).await;

        if is_brand_new {
            self.bus.publish(BusTopic::Room(room_id.to_string()), BusMessage::RoomCreated { room_id: room_id.to_string() }).await;
        }
        for event in &mapped {
            self.bus
                .publish(BusTopic::RoomState(room_id.to_string()), BusMessage::RoomStateUpdated { room_id: room_id.to_string(), event: event.clone() })
                .await;
        }
    }

    async fn process_join(&self, room_id: &str, section: &Value) {
        let (room, is_brand_new) = self.room_store.get_or_create(room_id).await;

        let state_events = json_array(&section["state"]["events"]);
        let mapped_state: Vec<Value> = state_events.iter().map(|e| self.mapper.map(e.clone(), Some(room_id))).collect();
        room.set_state_events(&mapped_state).await;

        // Unread counts are set before the later event emits so listeners
        // observe the right counts while reacting to those emits.
        if let Some(notif) = section["unread_notifications"]["notification_count"].as_u64() {
            room.set_unread_notification_count("total", notif).await;
        }
        if let Some(highlight) = section["unread_notifications"]["highlight_count"].as_u64() {
            room.set_unread_notification_count("highlight", highlight).await;
        }

        let limited = section["timeline"]["limited"].as_bool().unwrap_or(false);
        let prev_batch = section["timeline"]["prev_batch"].as_str().map(str::to_string);

        // Pagination token is set before timeline events are added so
        // scroll-back listeners reacting to those events see it correctly.
        if is_brand_new || limited {
            room.set_pagination_token(prev_batch).await;
        }

        let timeline_events = json_array(&section["timeline"]["events"]);
        let mapped_timeline: Vec<Value> = timeline_events.iter().map(|e| self.mapper.map(e.clone(), Some(room_id))).collect();
        room.add_events_to_timeline(&mapped_timeline, limited).await;

        let ephemeral = json_array(&section["ephemeral"]["events"]);
        let mapped_ephemeral: Vec<Value> = ephemeral.iter().map(|e| self.mapper.map(e.clone(), Some(room_id))).collect();
        room.add_events("ephemeral", &mapped_ephemeral).await;

        let account_data = json_array(&section["account_data"]["events"]);
        let mapped_account_data: Vec<Value> = account_data.iter().map(|e| self.mapper.map(e.clone(), Some(room_id))).collect();
        room.add_account_data(&mapped_account_data).await;

        room.recalculate(&self.config.user_id).await;

        if is_brand_new {
            self.bus.publish(BusTopic::Room(room_id.to_string()), BusMessage::RoomCreated { room_id: room_id.to_string() }).await;
        }
        for event in &mapped_state {
            self.bus
                .publish(BusTopic::RoomState(room_id.to_string()), BusMessage::RoomStateUpdated { room_id: room_id.to_string(), event: event.clone() })
                .await;
        }
        for event in &mapped_timeline {
            self.bus.publish(BusTopic::Event, BusMessage::Event { event: event.clone() }).await;
        }
    }

    async fn process_leave(&self, room_id: &str, section: &Value) {
        let (room, _is_brand_new) = self.room_store.get_or_create(room_id).await;
        let timeline_events = json_array(&section["timeline"]["events"]);
        let mapped: Vec<Value> = timeline_events.iter().map(|e| self.mapper.map(e.clone(), Some(room_id))).collect();
        room.add_events_to_timeline(&mapped, false).await;
    }

    /// One-shot fetch of historic left rooms via a special `include_leave`
    /// filter. Rooms already known to the store are skipped so a repeated
    /// call cannot duplicate their timeline.
    pub async fn sync_left_rooms(&self) -> Result<()> {
        let mut filter = FilterDefinition::new();
        filter.set_include_leave(true).set_timeline_limit(1);
        let query = vec![("filter".to_string(), filter.to_json().to_string())];
        let url = self.gateway.form_url("/sync", &[], None);
        let pending = self.gateway.authorized_request::<()>(Method::GET, url, query, None);
        let reply = await_with_deadline(&self.timer, pending, BUFFER_PERIOD_MS).await?;

        let Some(leaves) = reply.data["rooms"]["leave"].as_object() else { return Ok(()) };
        for (room_id, section) in leaves {
            if self.room_store.get(room_id).await.is_some() {
                continue;
            }
            self.process_leave(room_id, section).await;
        }
        Ok(())
    }
}

fn json_array(value: &Value) -> Vec<Value> {
    value.as_array().cloned().unwrap_or_default()
}
