//! Cache Events
//!
//! Every change the cache makes to an entry is announced on a tokio broadcast
//! channel, so observers (devtools, loggers, UI bridges) can follow cache
//! activity without holding the cache lock.
//!
//! # Event Flow
//!
//! 1. A read settles, a mutation writes optimistically, or an entry is invalidated
//! 2. The cache emits a [`CacheEvent`] after releasing its lock
//! 3. Subscribers receive it asynchronously; lagging subscribers drop old events

use crate::cache::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheEventKind {
    /// A read settled and wrote authoritative data
    Fetched,
    /// A read failed and recorded its error
    FetchFailed,
    /// An in-flight read was canceled before it could write
    Cancelled,
    /// A speculative or authoritative value was written by a mutation
    Updated,
    /// The entry was marked stale
    Invalidated,
    /// A snapshot was restored after a failed mutation
    RolledBack,
    /// The entry was removed
    Removed,
}

/// One cache change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub key: CacheKey,
    pub at: DateTime<Utc>,
}

impl CacheEvent {
    pub fn new(kind: CacheEventKind, key: CacheKey) -> Self {
        Self {
            kind,
            key,
            at: Utc::now(),
        }
    }

    /// String form of the event type, for logs
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            CacheEventKind::Fetched => "cache:fetched",
            CacheEventKind::FetchFailed => "cache:fetch-failed",
            CacheEventKind::Cancelled => "cache:cancelled",
            CacheEventKind::Updated => "cache:updated",
            CacheEventKind::Invalidated => "cache:invalidated",
            CacheEventKind::RolledBack => "cache:rolled-back",
            CacheEventKind::Removed => "cache:removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    #[test]
    fn test_event_serialization_contract() {
        let event = CacheEvent::new(
            CacheEventKind::Invalidated,
            CacheKey::list(EntityKind::Command),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["kind"], "invalidated");
        assert!(value.get("at").is_some());
        assert_eq!(event.event_type(), "cache:invalidated");
    }
}
