//! The long-poll sync engine: drives `/sync`, normalizes its paginated
//! room/state/timeline deltas into the caller's [`mx_core::ports::RoomModel`]
//! object model, and recovers from transport failure through a keep-alive
//! fallback. Peeking and the one-shot left-rooms sync live here too since
//! both ride the same [`mx_http::HttpGateway`] and filter machinery.

mod deadline;
mod engine;
mod filter;
mod keepalive;
mod peek;

pub use engine::{SyncEngine, SyncEngineConfig};
pub use filter::{FilterIdCache, InMemoryFilterIdCache, ResolvedFilter};
pub use keepalive::KeepAliveState;
