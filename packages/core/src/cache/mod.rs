//! Query Cache
//!
//! Memory-resident cache of gateway reads shared by every consumer:
//!
//! - `key` - Canonical cache keys and prefix matching
//! - `store` - The cache service: entries, tickets, holds, snapshots, observers
//! - `events` - Broadcast notifications of cache changes
//! - `error` - Errors surfaced by cached reads

mod error;
mod events;
pub mod key;
mod store;

pub use error::QueryError;
pub use events::{CacheEvent, CacheEventKind};
pub use key::{CacheKey, KeySegment};
pub use store::{
    CacheService, CacheState, CacheStats, CachedValue, Fetcher, QueryState, QueryStatus, ReadHold,
    Snapshot,
};
