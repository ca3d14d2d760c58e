//! Partial Entity Updates
//!
//! [`EntityPatch`] is a tagged variant per entity kind. Each variant carries
//! only the fields that kind may legally change, so a command patch can never
//! set a workflow's execution mode. Nullable relations use `Option<Option<T>>`:
//! the outer `Option` says whether the field is touched, the inner one is the
//! new (possibly cleared) value.
//!
//! Position, favorite and enabled flags are not patchable here; they change
//! through the dedicated move and toggle mutations.

use crate::models::entity::{
    Category, Command, Entity, EntityKind, ExecutionMode, Group, StepCondition, Workflow,
    WorkflowStep,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Keep `null` distinct from a missing field: missing leaves the relation
/// untouched, `null` clears it
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub icon: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub color: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub parent_group_id: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<Option<BTreeMap<String, String>>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub shell: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub icon: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<Option<BTreeMap<String, String>>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub shell: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowStepPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<Option<u32>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub auto_retry_count: Option<Option<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_on_failure: Option<bool>,
}

/// A partial update for exactly one entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntityPatch {
    Category(CategoryPatch),
    Command(CommandPatch),
    Group(GroupPatch),
    Workflow(WorkflowPatch),
    WorkflowStep(WorkflowStepPatch),
}

fn merge<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

impl CategoryPatch {
    fn apply(&self, category: &mut Category) {
        merge(&mut category.name, &self.name);
        merge(&mut category.description, &self.description);
        merge(&mut category.icon, &self.icon);
        merge(&mut category.color, &self.color);
    }
}

impl GroupPatch {
    fn apply(&self, group: &mut Group) {
        merge(&mut group.name, &self.name);
        merge(&mut group.description, &self.description);
        merge(&mut group.parent_group_id, &self.parent_group_id);
        merge(&mut group.category_id, &self.category_id);
        merge(&mut group.working_directory, &self.working_directory);
        merge(&mut group.env_vars, &self.env_vars);
        merge(&mut group.shell, &self.shell);
        merge(&mut group.icon, &self.icon);
    }
}

impl CommandPatch {
    fn apply(&self, command: &mut Command) {
        merge(&mut command.name, &self.name);
        merge(&mut command.description, &self.description);
        merge(&mut command.command, &self.command);
        merge(&mut command.arguments, &self.arguments);
        merge(&mut command.group_id, &self.group_id);
        merge(&mut command.category_id, &self.category_id);
        merge(&mut command.working_directory, &self.working_directory);
        merge(&mut command.env_vars, &self.env_vars);
        merge(&mut command.shell, &self.shell);
    }
}

impl WorkflowPatch {
    fn apply(&self, workflow: &mut Workflow) {
        merge(&mut workflow.name, &self.name);
        merge(&mut workflow.description, &self.description);
        merge(&mut workflow.category_id, &self.category_id);
        merge(&mut workflow.execution_mode, &self.execution_mode);
    }
}

impl WorkflowStepPatch {
    fn apply(&self, step: &mut WorkflowStep) {
        merge(&mut step.name, &self.name);
        merge(&mut step.description, &self.description);
        merge(&mut step.command_id, &self.command_id);
        merge(&mut step.condition, &self.condition);
        merge(&mut step.timeout_seconds, &self.timeout_seconds);
        merge(&mut step.auto_retry_count, &self.auto_retry_count);
        merge(&mut step.continue_on_failure, &self.continue_on_failure);
    }
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPatch::Category(_) => EntityKind::Category,
            EntityPatch::Command(_) => EntityKind::Command,
            EntityPatch::Group(_) => EntityKind::Group,
            EntityPatch::Workflow(_) => EntityKind::Workflow,
            EntityPatch::WorkflowStep(_) => EntityKind::WorkflowStep,
        }
    }

    /// Merge the touched fields into `entity`
    ///
    /// Returns `false` and leaves the entity untouched when kinds differ.
    pub fn apply(&self, entity: &mut Entity) -> bool {
        match (self, entity) {
            (EntityPatch::Category(p), Entity::Category(e)) => p.apply(e),
            (EntityPatch::Command(p), Entity::Command(e)) => p.apply(e),
            (EntityPatch::Group(p), Entity::Group(e)) => p.apply(e),
            (EntityPatch::Workflow(p), Entity::Workflow(e)) => p.apply(e),
            (EntityPatch::WorkflowStep(p), Entity::WorkflowStep(e)) => p.apply(e),
            _ => return false,
        }
        true
    }

    /// Whether the patch changes a field that decides list membership
    /// (parent group, category or command reference)
    pub fn changes_scope(&self) -> bool {
        match self {
            EntityPatch::Command(p) => p.group_id.is_some() || p.category_id.is_some(),
            EntityPatch::Group(p) => p.parent_group_id.is_some() || p.category_id.is_some(),
            EntityPatch::Workflow(p) => p.category_id.is_some(),
            EntityPatch::WorkflowStep(p) => p.command_id.is_some(),
            EntityPatch::Category(_) => false,
        }
    }
}

impl From<CategoryPatch> for EntityPatch {
    fn from(value: CategoryPatch) -> Self {
        EntityPatch::Category(value)
    }
}

impl From<CommandPatch> for EntityPatch {
    fn from(value: CommandPatch) -> Self {
        EntityPatch::Command(value)
    }
}

impl From<GroupPatch> for EntityPatch {
    fn from(value: GroupPatch) -> Self {
        EntityPatch::Group(value)
    }
}

impl From<WorkflowPatch> for EntityPatch {
    fn from(value: WorkflowPatch) -> Self {
        EntityPatch::Workflow(value)
    }
}

impl From<WorkflowStepPatch> for EntityPatch {
    fn from(value: WorkflowStepPatch) -> Self {
        EntityPatch::WorkflowStep(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_patch_merges_only_touched_fields() {
        let mut entity = Entity::from(Command {
            id: 7,
            name: "old".into(),
            command: "ls".into(),
            category_id: Some(2),
            ..Default::default()
        });

        let patch = EntityPatch::from(CommandPatch {
            name: Some("new".into()),
            category_id: Some(None),
            ..Default::default()
        });
        assert!(patch.apply(&mut entity));

        let Entity::Command(command) = entity else {
            panic!("expected command");
        };
        assert_eq!(command.name, "new");
        assert_eq!(command.command, "ls");
        assert_eq!(command.category_id, None);
    }

    #[test]
    fn test_patch_rejects_other_kind() {
        let mut entity = Entity::from(Workflow::draft("deploy"));
        let before = entity.clone();
        let patch = EntityPatch::from(GroupPatch {
            name: Some("x".into()),
            ..Default::default()
        });

        assert!(!patch.apply(&mut entity));
        assert_eq!(entity, before);
    }

    #[test]
    fn test_changes_scope() {
        let reparent = EntityPatch::from(GroupPatch {
            parent_group_id: Some(Some(3)),
            ..Default::default()
        });
        assert!(reparent.changes_scope());

        let rename = EntityPatch::from(GroupPatch {
            name: Some("x".into()),
            ..Default::default()
        });
        assert!(!rename.changes_scope());
    }

    #[test]
    fn test_null_clears_and_missing_leaves_untouched() {
        let patch: CommandPatch =
            serde_json::from_value(serde_json::json!({"groupId": null, "name": "x"})).unwrap();
        assert_eq!(patch.group_id, Some(None));
        assert_eq!(patch.category_id, None);

        let wire = serde_json::to_value(&patch).unwrap();
        assert!(wire["groupId"].is_null());
        assert!(wire.get("categoryId").is_none());
    }
}
