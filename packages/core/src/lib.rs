//! cmdshelf Core Data Coherence Layer
//!
//! This crate keeps a client-side view of the cmdshelf collection (categories,
//! commands, groups, workflows and workflow steps) coherent with the remote
//! authority that owns it.
//!
//! # Architecture
//!
//! - **Query Cache**: one process-wide, memory-resident cache keyed by
//!   hierarchical keys; prefix matching drives invalidation
//! - **Optimistic Mutations**: writes land in the cache before the gateway
//!   answers and are rolled back exactly on failure
//! - **Gap Ordering**: siblings carry floating positions with a gap of 1000,
//!   moves take the midpoint and renumber when the gap runs out
//! - **Declarative Invalidation**: each mutation maps to the set of keys it
//!   outdates, including related kinds
//!
//! # Modules
//!
//! - [`models`] - Entities, filter scopes and patches
//! - [`cache`] - Cache keys, the cache service and its events
//! - [`gateway`] - Remote authority contract plus invoke and in-memory gateways
//! - [`ordering`] - Sibling reorder engine
//! - [`services`] - Queries, the mutation coordinator, invalidation and the client
//! - [`config`] - Cache and ordering tuning
//! - [`logging`] - Tracing subscriber setup

pub mod cache;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod ordering;
pub mod services;

// Re-export commonly used types
pub use cache::{CacheKey, CacheService, QueryError};
pub use config::{CacheConfig, ConfigError, OrderingConfig};
pub use gateway::{EntityGateway, GatewayError, InMemoryGateway};
pub use models::*;
pub use services::*;
