//! Remote Entity Gateway
//!
//! The remote authority owns every entity. This module defines the typed
//! boundary the cache talks to, plus two implementations:
//!
//! - [`InvokeGateway`] - maps each call onto an `(operationName, argumentRecord)`
//!   request through an [`Invoker`] transport
//! - [`InMemoryGateway`] - authoritative reference store used by tests and demos
//!
//! # Design Decisions
//!
//! 1. **Async-First**: every call suspends the caller; cache work never does
//! 2. **Not Idempotent**: calling `create` twice creates two entities; the
//!    core never deduplicates requests
//! 3. **Structured Errors**: failures carry a `{code, message}` pair, see
//!    [`GatewayError`]
//!
//! # Examples
//!
//! ```rust
//! use cmdshelf_core::gateway::{EntityGateway, InMemoryGateway};
//! use cmdshelf_core::models::{Category, Entity, EntityKind, FilterScope};
//!
//! # tokio_test::block_on(async {
//! let gateway = InMemoryGateway::new();
//! let id = gateway.create(&Entity::from(Category::draft("Git"))).await.unwrap();
//!
//! let all = gateway.list(EntityKind::Category, &FilterScope::root()).await.unwrap();
//! assert_eq!(all.len(), 1);
//! assert_eq!(all[0].id(), id);
//! # });
//! ```

pub mod error;
mod invoke;
mod memory;

pub use error::GatewayError;
pub use invoke::{InvokeGateway, Invoker};
pub use memory::InMemoryGateway;

use crate::models::{Command, Entity, EntityKind, EntityPatch, FilterScope, Group, MoveRequest, WorkflowStep};
use async_trait::async_trait;
use std::fmt;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Aggregate counts the remote authority can compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountQuery {
    /// Steps in one workflow
    WorkflowSteps(i64),
    /// Commands referencing one category
    CategoryCommands(i64),
    /// Workflows referencing one category
    CategoryWorkflows(i64),
}

/// Gateway operation families, used for failure injection and latency tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
    Move,
    ToggleFavorite,
    ToggleEnabled,
    Count,
    GroupTree,
    GroupPath,
    StepsWithCommands,
    SearchCommands,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed boundary to the remote authority
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the coordinator and background
/// refetches share one `Arc<dyn EntityGateway>`.
#[async_trait]
pub trait EntityGateway: Send + Sync {
    //
    // READS
    //

    async fn get(&self, kind: EntityKind, id: i64) -> GatewayResult<Entity>;

    /// Entities of `kind` in one filter scope, in display order
    async fn list(&self, kind: EntityKind, filter: &FilterScope) -> GatewayResult<Vec<Entity>>;

    //
    // MUTATIONS
    //

    /// Persist a draft and return its new id
    ///
    /// # Errors
    ///
    /// `INVALID_DATA` when the payload id is not 0.
    async fn create(&self, entity: &Entity) -> GatewayResult<i64>;

    /// Merge the touched fields of `patch` into entity `id`
    async fn update(&self, id: i64, patch: &EntityPatch) -> GatewayResult<()>;

    async fn delete(&self, kind: EntityKind, id: i64) -> GatewayResult<()>;

    /// Place `request.id` between two siblings of its scope
    ///
    /// # Errors
    ///
    /// `INVALID_DATA` when a neighbor sits in another scope, `NOT_FOUND` when
    /// the entity or a neighbor does not exist.
    async fn move_between(&self, kind: EntityKind, request: MoveRequest) -> GatewayResult<()>;

    async fn toggle_favorite(&self, kind: EntityKind, id: i64) -> GatewayResult<()>;

    /// Flip the `enabled` flag of a workflow step
    async fn toggle_enabled(&self, step_id: i64) -> GatewayResult<()>;

    //
    // AUXILIARY READS
    //

    async fn count(&self, query: CountQuery) -> GatewayResult<i64>;

    /// A group and all its descendants, ordered by position
    async fn group_tree(&self, root_id: i64) -> GatewayResult<Vec<Group>>;

    /// Names from the root group down to `group_id`
    async fn group_path(&self, group_id: i64) -> GatewayResult<Vec<String>>;

    /// Steps of one workflow joined with the command each one runs
    async fn steps_with_commands(
        &self,
        workflow_id: i64,
        enabled_only: bool,
    ) -> GatewayResult<Vec<(WorkflowStep, Command)>>;

    /// Commands whose name, command text or description contains `term`
    async fn search_commands(&self, term: &str) -> GatewayResult<Vec<Command>>;
}
