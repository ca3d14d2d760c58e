//! Data Models
//!
//! This module contains the data structures shared by every cmdshelf component:
//!
//! - `Entity` - Tagged record over the five kinds (Category, Command, Group,
//!   Workflow, WorkflowStep)
//! - `FilterScope` - Structural filter identifying a sibling domain and a list view
//! - `EntityPatch` - Kind-checked partial updates used by optimistic mutations

mod entity;
mod filter;
mod patch;

pub use entity::{
    Category, Command, Entity, EntityKind, EntityRecord, ExecutionMode, Group, StepCondition,
    Workflow, WorkflowStep, DRAFT_ID,
};
pub use filter::{FilterError, FilterField, FilterScope, FilterValue, NormalizedFilter};
pub use patch::{
    CategoryPatch, CommandPatch, EntityPatch, GroupPatch, WorkflowPatch, WorkflowStepPatch,
};

/// Request to place an entity between two named siblings
///
/// `prev_id = None` moves to the start of the scope, `next_id = None` to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub id: i64,
    pub prev_id: Option<i64>,
    pub next_id: Option<i64>,
}

impl MoveRequest {
    pub fn between(id: i64, prev_id: Option<i64>, next_id: Option<i64>) -> Self {
        Self {
            id,
            prev_id,
            next_id,
        }
    }
}
