//! Resolves the sync filter the main loop passes to `/sync`.
//!
//! Non-guest sessions get a server-stored filter, created once and cached
//! under a user-scoped name (`FILTER_SYNC_<user>`); guests cannot create
//! filters server-side, so they pass the filter body inline on every request.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// Where a resolved filter id is cached between process runs. The in-memory
/// default below is enough for a single process lifetime; a persistent
/// implementation is the caller's concern, same as [`mx_core::SessionStore`].
#[async_trait]
pub trait FilterIdCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, filter_id: String);
}

#[derive(Default)]
pub struct InMemoryFilterIdCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryFilterIdCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FilterIdCache for InMemoryFilterIdCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn set(&self, key: &str, filter_id: String) {
        self.entries.lock().unwrap().insert(key.to_string(), filter_id);
    }
}

/// Whether `/sync` should reference a server-side filter by id or carry the
/// definition inline — guests always take the inline path.
#[derive(Debug, Clone)]
pub enum ResolvedFilter {
    Id(String),
    Inline(String),
}

impl ResolvedFilter {
    /// The `filter` query parameter value, either shape.
    pub fn query_value(&self) -> &str {
        match self {
            ResolvedFilter::Id(id) => id,
            ResolvedFilter::Inline(json) => json,
        }
    }
}
