//! Collaborator interfaces the engine consumes but never owns.
//!
//! The engine depends on these traits, never on a concrete `Room`/`MatrixClient`
//! type — callers wire in their own object model. This mirrors how
//! `sem_os_core::ports` keeps `CoreService` decoupled from `sem_os_postgres`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Olm-style pickled account/session storage. Every mutation must be
/// persisted atomically with the state it operated on — callers treat
/// `unpickle -> operate -> pickle -> store` as one critical section.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_account(&self) -> Result<Option<Vec<u8>>>;
    async fn store_account(&self, pickled: Vec<u8>) -> Result<()>;
    async fn get_sessions(&self, identity_key: &str) -> Result<Vec<(String, Vec<u8>)>>;
    async fn store_session(&self, identity_key: &str, session_id: &str, pickled: Vec<u8>) -> Result<()>;
}

/// Per-room state the sync engine mutates. Implemented by the caller's room
/// object model; the engine only ever calls through this trait.
#[async_trait]
pub trait RoomModel: Send + Sync {
    fn room_id(&self) -> &str;

    async fn set_state_events(&self, events: &[Value]);
    async fn add_events_to_timeline(&self, events: &[Value], limited: bool);
    async fn add_events(&self, kind: &str, events: &[Value]);
    async fn add_account_data(&self, events: &[Value]);
    async fn set_unread_notification_count(&self, kind: &str, count: u64);
    async fn recalculate(&self, user_id: &str);

    /// The room's current pagination token, set before timeline events are
    /// added so listeners that scroll back in response observe it correctly.
    async fn set_pagination_token(&self, token: Option<String>);
    async fn pagination_token(&self) -> Option<String>;
}

/// Looks up or lazily creates the `RoomModel` for a room id. Implemented by
/// the caller's client/store; the sync engine never constructs rooms itself.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// `true` iff no entry existed for `room_id` before this call.
    async fn get_or_create(&self, room_id: &str) -> (std::sync::Arc<dyn RoomModel>, bool);
    async fn get(&self, room_id: &str) -> Option<std::sync::Arc<dyn RoomModel>>;
}

/// Turns raw JSON into whatever event type the caller's object model uses.
/// The sync engine stamps `room_id` on the result when sync context requires it.
pub trait EventMapper: Send + Sync {
    fn map(&self, raw: Value, room_id: Option<&str>) -> Value;
}

/// Fan-out notification names the engine raises. A typed message bus is used
/// instead of re-emitting through a chain of nested `EventEmitter`-style
/// forwarders — callers subscribe to exactly the names they care about,
/// looked up by entity id rather than held by owning pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusTopic {
    Room(String),
    RoomState(String),
    RoomMember(String),
    Event,
    Sync,
}

#[derive(Debug, Clone)]
pub enum BusMessage {
    RoomCreated { room_id: String },
    RoomStateUpdated { room_id: String, event: Value },
    RoomMemberUpdated { room_id: String, user_id: String, event: Value },
    Event { event: Value },
    SyncStateChanged { state: crate::model::SyncState, error: Option<String> },
    Presence { user_id: String, event: Value },
}

/// Single dispatch table keyed by topic; callers subscribe via
/// [`EventBus::subscribe`] rather than reaching into the engine's internals.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: BusTopic, message: BusMessage);
}

/// A no-op bus for engines constructed without a caller-supplied sink —
/// useful in tests that only assert on store-level effects.
pub struct NullEventBus;

#[async_trait]
impl EventBus for NullEventBus {
    async fn publish(&self, _topic: BusTopic, _message: BusMessage) {}
}
