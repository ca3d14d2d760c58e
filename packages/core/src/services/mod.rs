//! Business Services
//!
//! This module contains the services consumers talk to:
//!
//! - `QueryService` - Cached reads returning live `QueryHandle`s
//! - `MutationCoordinator` - Optimistic mutations with snapshot and rollback
//! - `InvalidationPropagator` - Declarative cascade from a mutation to the keys it outdates
//! - `CollectionClient` - Typed per-kind facade over the two above
//!
//! Services coordinate between the query cache and the remote gateway; the
//! cache itself never talks to the gateway except through registered fetchers.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod invalidation;
pub mod query;

pub use client::{CollectionClient, Records};
pub use coordinator::MutationCoordinator;
pub use error::{CoordinatorError, MutationFailure, MutationRequest, MutationResult};
pub use invalidation::{
    AppliedPlan, Change, InvalidationPlan, InvalidationPropagator, InvalidationTarget,
    MutationKind, Relations,
};
pub use query::{FromCached, QueryHandle, QueryService};
