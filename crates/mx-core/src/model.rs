//! The narrow set of domain types shared by the sync engine, the scheduler,
//! and the interactive-auth driver. Everything room/event-shaped beyond this
//! is the caller's `RoomModel`/`EventMapper` implementation — see [`crate::ports`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Opaque server-issued cursor into the `/sync` stream. Persisted between
/// syncs; compared only for equality, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncToken(pub String);

impl SyncToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SyncToken {
    fn from(s: String) -> Self {
        SyncToken(s)
    }
}

impl std::fmt::Display for SyncToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of the sync loop. `recalculate`d and re-emitted on every
/// transition, including steady-state `Syncing` after `Syncing`, so bulk
/// listeners can gate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Initial,
    Prepared,
    Syncing,
    Error,
    Stopped,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Initial => "INITIAL",
            SyncState::Prepared => "PREPARED",
            SyncState::Syncing => "SYNCING",
            SyncState::Error => "ERROR",
            SyncState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which membership section of a `/sync` response a room fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipSection {
    Invite,
    Join,
    Leave,
}

/// One room's slice of a `/sync` response, normalized out of the raw JSON
/// body before it is handed to the caller's [`crate::ports::RoomModel`].
#[derive(Debug, Clone)]
pub struct RoomDelta {
    pub room_id: String,
    pub section: MembershipSection,
    /// `invite_state` for invites, pre-timeline `state` for joins; empty for leaves.
    pub state_events: Vec<Value>,
    pub timeline_events: Vec<Value>,
    pub ephemeral_events: Vec<Value>,
    pub account_data_events: Vec<Value>,
    pub unread_notification_count: Option<u64>,
    pub unread_highlight_count: Option<u64>,
    /// `timeline.prev_batch`, carried forward only when the room is brand new
    /// or the timeline was limited — see `timeline_limited`.
    pub pagination_token: Option<String>,
    pub timeline_limited: bool,
    /// `true` iff the local store had no entry for this room before this batch.
    pub is_brand_new_room: bool,
}

impl RoomDelta {
    pub fn new(room_id: impl Into<String>, section: MembershipSection, is_brand_new_room: bool) -> Self {
        Self {
            room_id: room_id.into(),
            section,
            state_events: Vec::new(),
            timeline_events: Vec::new(),
            ephemeral_events: Vec::new(),
            account_data_events: Vec::new(),
            unread_notification_count: None,
            unread_highlight_count: None,
            pagination_token: None,
            timeline_limited: false,
            is_brand_new_room,
        }
    }
}

/// A server-stored filter definition. Setters mutate the nested JSON shape;
/// `to_json` is the wire body uploaded to `POST /filter`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_format: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    room: BTreeMap<String, Value>,
}

impl FilterDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_event_format(&mut self, format: impl Into<String>) -> &mut Self {
        self.event_format = Some(format.into());
        self
    }

    pub fn set_timeline_limit(&mut self, limit: u32) -> &mut Self {
        self.set_nested(&["timeline", "limit"], Value::from(limit));
        self
    }

    pub fn set_include_leave(&mut self, include: bool) -> &mut Self {
        self.set_nested(&["include_leave"], Value::from(include));
        self
    }

    pub fn set_lazy_load_members(&mut self, lazy: bool) -> &mut Self {
        self.set_nested(&["state", "lazy_load_members"], Value::from(lazy));
        self
    }

    /// Write `val` at the path described by `nested_keys` under `room`,
    /// creating intermediate objects as needed.
    ///
    /// The final key is always looked up by name, never by the length of
    /// `nested_keys` — a sibling helper in the source repo this was modeled
    /// on indexes with the numeric length instead of the final key, which
    /// silently drops the write into the wrong slot. That form is not
    /// reproduced here.
    fn set_nested(&mut self, nested_keys: &[&str], val: Value) {
        let (first, rest) = match nested_keys.split_first() {
            Some(pair) => pair,
            None => return,
        };
        let mut current = self
            .room
            .entry(first.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        for key in rest {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            current = current
                .as_object_mut()
                .expect("just normalized to object")
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        *current = val;
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if let Some(fmt) = &self.event_format {
            obj.insert("event_format".to_string(), Value::from(fmt.clone()));
        }
        for (k, v) in &self.room {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

/// A stable, user-scoped name under which a server filter id is cached —
/// `FILTER_SYNC_<user_id>`.
pub fn sync_filter_cache_key(user_id: &str) -> String {
    format!("FILTER_SYNC_{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_definition_sets_nested_paths() {
        let mut f = FilterDefinition::new();
        f.set_timeline_limit(20).set_include_leave(true).set_lazy_load_members(true);
        let json = f.to_json();
        assert_eq!(json["timeline"]["limit"], 20);
        assert_eq!(json["include_leave"], true);
        assert_eq!(json["state"]["lazy_load_members"], true);
    }

    #[test]
    fn filter_definition_overwrite_keeps_siblings() {
        let mut f = FilterDefinition::new();
        f.set_timeline_limit(10);
        f.set_nested(&["timeline", "limit"], Value::from(30));
        assert_eq!(f.to_json()["timeline"]["limit"], 30);
    }

    #[test]
    fn sync_state_round_trips_display() {
        assert_eq!(SyncState::Prepared.to_string(), "PREPARED");
    }
}
