//! Shared domain types, error kinds, and collaborator port traits.
//!
//! Every other crate in this workspace depends on `mx-core` and nothing
//! else upstream of it — it has no opinions on HTTP, timers, or retries.

pub mod error;
pub mod model;
pub mod ports;

pub use error::{MxError, Result};
pub use model::{sync_filter_cache_key, FilterDefinition, MembershipSection, RoomDelta, SyncState, SyncToken};
pub use ports::{BusMessage, BusTopic, EventBus, EventMapper, NullEventBus, RoomModel, RoomStore, SessionStore};
