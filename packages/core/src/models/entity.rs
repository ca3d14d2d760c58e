//! Entity Data Structures
//!
//! This module defines the five persisted entity kinds managed by cmdshelf and
//! the tagged [`Entity`] enum the query cache stores them as.
//!
//! # Architecture
//!
//! - **Shared base fields**: every kind has `id`, `name`, `description`,
//!   `position`, `is_favorite` and opaque timestamps
//! - **Drafts**: `id == 0` denotes an entity that has not been persisted yet
//! - **Opaque payload**: command text, arguments, environment and shell are
//!   round-tripped, never interpreted
//! - **Wire format**: camelCase field names, matching the gateway argument records
//!
//! # Examples
//!
//! ```rust
//! use cmdshelf_core::models::{Command, Entity, EntityKind};
//!
//! let draft = Command::draft("List files", "ls");
//! assert!(draft.id == 0);
//!
//! let entity = Entity::from(draft);
//! assert_eq!(entity.kind(), EntityKind::Command);
//! assert!(entity.is_draft());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a draft entity that has not been persisted yet
pub const DRAFT_ID: i64 = 0;

/// The five entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Category,
    Command,
    Group,
    Workflow,
    WorkflowStep,
}

impl EntityKind {
    /// All kinds, in cascade-table order
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Category,
        EntityKind::Command,
        EntityKind::Group,
        EntityKind::Workflow,
        EntityKind::WorkflowStep,
    ];

    /// Key prefix for this kind, unique per kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Category => "categories",
            EntityKind::Command => "commands",
            EntityKind::Group => "groups",
            EntityKind::Workflow => "workflows",
            EntityKind::WorkflowStep => "workflowSteps",
        }
    }

    /// Singular noun used in gateway operation names (`get_command`, `delete_group`, ...)
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::Category => "category",
            EntityKind::Command => "command",
            EntityKind::Group => "group",
            EntityKind::Workflow => "workflow",
            EntityKind::WorkflowStep => "workflow_step",
        }
    }

    /// Whether entities of this kind participate in sibling ordering via `move`
    pub fn is_orderable(&self) -> bool {
        !matches!(self, EntityKind::Category)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the steps of a workflow are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

/// When a workflow step runs relative to the previous step's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
}

/// Flat label referenced by commands, groups and workflows
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub position: f64,
    pub is_favorite: bool,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Tree node grouping commands; root groups have no `parent_group_id`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub position: f64,
    pub is_favorite: bool,
    pub parent_group_id: Option<i64>,
    pub category_id: Option<i64>,
    pub working_directory: Option<String>,
    pub env_vars: Option<BTreeMap<String, String>>,
    pub shell: Option<String>,
    pub icon: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// A stored shell command
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Command {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub position: f64,
    pub is_favorite: bool,
    pub command: String,
    pub arguments: Vec<String>,
    pub group_id: Option<i64>,
    pub category_id: Option<i64>,
    pub working_directory: Option<String>,
    pub env_vars: Option<BTreeMap<String, String>>,
    pub shell: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// An ordered collection of steps
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub position: f64,
    pub is_favorite: bool,
    pub category_id: Option<i64>,
    pub execution_mode: ExecutionMode,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// One command invocation inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowStep {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub position: f64,
    pub is_favorite: bool,
    pub workflow_id: i64,
    pub command_id: i64,
    pub condition: StepCondition,
    pub timeout_seconds: Option<u32>,
    pub auto_retry_count: Option<u8>,
    pub enabled: bool,
    pub continue_on_failure: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Default for WorkflowStep {
    fn default() -> Self {
        Self {
            id: DRAFT_ID,
            name: String::new(),
            description: None,
            position: 0.0,
            is_favorite: false,
            workflow_id: 0,
            command_id: 0,
            condition: StepCondition::Always,
            timeout_seconds: None,
            auto_retry_count: None,
            enabled: true,
            continue_on_failure: false,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Category {
    pub fn draft(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Group {
    pub fn draft(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Command {
    pub fn draft(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }
}

impl Workflow {
    pub fn draft(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl WorkflowStep {
    pub fn draft(workflow_id: i64, command_id: i64) -> Self {
        Self {
            workflow_id,
            command_id,
            ..Default::default()
        }
    }
}

/// Any persisted record, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entity {
    Category(Category),
    Command(Command),
    Group(Group),
    Workflow(Workflow),
    WorkflowStep(WorkflowStep),
}

macro_rules! each_entity {
    ($entity:expr, $inner:ident => $body:expr) => {
        match $entity {
            Entity::Category($inner) => $body,
            Entity::Command($inner) => $body,
            Entity::Group($inner) => $body,
            Entity::Workflow($inner) => $body,
            Entity::WorkflowStep($inner) => $body,
        }
    };
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Category(_) => EntityKind::Category,
            Entity::Command(_) => EntityKind::Command,
            Entity::Group(_) => EntityKind::Group,
            Entity::Workflow(_) => EntityKind::Workflow,
            Entity::WorkflowStep(_) => EntityKind::WorkflowStep,
        }
    }

    pub fn id(&self) -> i64 {
        each_entity!(self, e => e.id)
    }

    pub fn set_id(&mut self, id: i64) {
        each_entity!(self, e => e.id = id)
    }

    pub fn name(&self) -> &str {
        each_entity!(self, e => e.name.as_str())
    }

    pub fn position(&self) -> f64 {
        each_entity!(self, e => e.position)
    }

    pub fn set_position(&mut self, position: f64) {
        each_entity!(self, e => e.position = position)
    }

    pub fn is_favorite(&self) -> bool {
        each_entity!(self, e => e.is_favorite)
    }

    pub fn set_favorite(&mut self, favorite: bool) {
        each_entity!(self, e => e.is_favorite = favorite)
    }

    /// Record a write time; `created` also sets `created_at`
    pub fn set_timestamps(&mut self, at: &str, created: bool) {
        each_entity!(self, e => {
            if created {
                e.created_at = Some(at.to_string());
            }
            e.updated_at = Some(at.to_string());
        })
    }

    /// True when this entity has not been persisted yet
    pub fn is_draft(&self) -> bool {
        self.id() == DRAFT_ID
    }

    /// Check whether this entity has the given kind and id
    pub fn is(&self, kind: EntityKind, id: i64) -> bool {
        self.kind() == kind && self.id() == id
    }

    /// Parent in the sibling-ordering sense: the group of a command, the
    /// parent of a group, the workflow of a step
    pub fn scope_parent(&self) -> Option<i64> {
        match self {
            Entity::Command(c) => c.group_id,
            Entity::Group(g) => g.parent_group_id,
            Entity::WorkflowStep(s) => Some(s.workflow_id),
            Entity::Category(_) | Entity::Workflow(_) => None,
        }
    }

    pub fn category_id(&self) -> Option<i64> {
        match self {
            Entity::Command(c) => c.category_id,
            Entity::Group(g) => g.category_id,
            Entity::Workflow(w) => w.category_id,
            Entity::Category(_) | Entity::WorkflowStep(_) => None,
        }
    }
}

macro_rules! entity_conversions {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Entity {
                fn from(value: $variant) -> Self {
                    Entity::$variant(value)
                }
            }

            impl TryFrom<Entity> for $variant {
                type Error = Entity;

                fn try_from(value: Entity) -> Result<Self, Self::Error> {
                    match value {
                        Entity::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }

            impl EntityRecord for $variant {
                const KIND: EntityKind = EntityKind::$variant;
            }
        )*
    };
}

/// Statically-typed view over one entity kind
///
/// Implemented by each concrete entity struct so that consumer handles can
/// decode cached [`Entity`] values back into their concrete type.
pub trait EntityRecord:
    Clone + Into<Entity> + TryFrom<Entity, Error = Entity> + Send + Sync + 'static
{
    const KIND: EntityKind;
}

entity_conversions!(Category, Command, Group, Workflow, WorkflowStep);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format_is_camel_case() {
        let mut command = Command::draft("Build", "cargo");
        command.group_id = Some(3);
        command.is_favorite = true;

        let value = serde_json::to_value(Entity::from(command)).unwrap();
        assert_eq!(value["kind"], "command");
        assert_eq!(value["groupId"], 3);
        assert_eq!(value["isFavorite"], true);
        assert!(value.get("group_id").is_none());
    }

    #[test]
    fn test_step_defaults_when_fields_missing() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "id": 4,
            "workflowId": 1,
            "commandId": 2,
            "condition": "on_failure"
        }))
        .unwrap();

        assert_eq!(step.condition, StepCondition::OnFailure);
        assert!(step.enabled);
        assert!(step.created_at.is_none());
    }

    #[test]
    fn test_scope_parent_per_kind() {
        let mut group = Group::draft("ops");
        group.parent_group_id = Some(9);
        assert_eq!(Entity::from(group).scope_parent(), Some(9));

        let step = WorkflowStep::draft(5, 6);
        assert_eq!(Entity::from(step).scope_parent(), Some(5));

        assert_eq!(Entity::from(Workflow::draft("w")).scope_parent(), None);
    }

    #[test]
    fn test_try_from_wrong_kind_returns_entity() {
        let entity = Entity::from(Category::draft("tools"));
        let back = Command::try_from(entity.clone());
        assert_eq!(back.unwrap_err(), entity);
    }

    #[test]
    fn test_env_vars_have_map_semantics() {
        let command: Command = serde_json::from_value(json!({
            "name": "env",
            "command": "env",
            "envVars": {"B": "2", "A": "1"}
        }))
        .unwrap();

        let keys: Vec<_> = command.env_vars.unwrap().into_keys().collect();
        assert_eq!(keys, vec!["A".to_string(), "B".to_string()]);
    }
}
