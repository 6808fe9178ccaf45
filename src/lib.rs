//! matrix-engine: client-side Matrix protocol engine.
//!
//! This crate is an assembly point — the real logic lives in the workspace
//! members it re-exports:
//! - [`mx_core`]: shared domain types, error kinds, collaborator port traits.
//! - [`mx_timer`]: the process-wide realtime timer.
//! - [`mx_http`]: the HTTP gateway and upload surface.
//! - [`mx_scheduler`]: named FIFO queues with retry-policy-driven backoff.
//! - [`mx_auth`]: the interactive-authentication (UIA) negotiator.
//! - [`mx_sync`]: the long-poll sync engine, peek, and left-rooms sync.
//!
//! A caller wires these together: construct a [`mx_timer::RealtimeTimer`],
//! build an [`mx_http::HttpGateway`] on top of it, then a [`mx_sync::SyncEngine`]
//! and a [`mx_scheduler::Scheduler`] on top of that, supplying its own
//! `RoomStore`/`RoomModel`/`EventMapper`/`EventBus` implementations (see
//! [`mx_core::ports`]).

pub use mx_auth as auth;
pub use mx_core as core;
pub use mx_http as http;
pub use mx_scheduler as scheduler;
pub use mx_sync as sync;
pub use mx_timer as timer;

pub use mx_core::{MxError, Result};
