//! Cache Key Builder
//!
//! Turns `(entity kind, variant, optional filter)` into a canonical
//! [`CacheKey`]. Keys are segment vectors compared structurally, and prefix
//! matching (`starts_with`) is how invalidation and removal target whole
//! families of entries.
//!
//! # Layout
//!
//! ```text
//! all(kind)                  [kind]
//! list(kind)                 [kind, "list"]
//! filtered_list(kind, f)     [kind, "list", {normalized f}]
//! detail(kind, id)           [kind, "detail", id]
//!
//! steps by workflow          [workflows, "detail", w, workflowSteps, "list", {rest}]
//! steps by command           [commands, "detail", c, workflowSteps, "list", {rest}]
//! step count                 [workflows, "detail", w, "step-count"]
//! ```
//!
//! Routing workflow-step lists through their parent's detail key means that
//! removing a deleted workflow's detail subtree also drops its step lists.

use crate::models::{EntityKind, FilterField, FilterScope, NormalizedFilter};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LIST: &str = "list";
pub const DETAIL: &str = "detail";
pub const SEARCH: &str = "search";
pub const WORKFLOW_STEP_COUNT: &str = "step-count";
pub const COMMAND_POPULATED_STEP: &str = "populated";
pub const CATEGORY_COMMAND_COUNT: &str = "command-count";
pub const CATEGORY_WORKFLOW_COUNT: &str = "workflow-count";
pub const GROUP_TREE: &str = "tree";
pub const GROUP_PATH: &str = "path";

/// One component of a cache key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeySegment {
    Kind(EntityKind),
    Label(String),
    Id(i64),
    Text(String),
    Filter(NormalizedFilter),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Kind(kind) => write!(f, "{}", kind),
            KeySegment::Label(label) => write!(f, "{}", label),
            KeySegment::Id(id) => write!(f, "{}", id),
            KeySegment::Text(text) => write!(f, "{:?}", text),
            KeySegment::Filter(filter) => write!(f, "{}", filter),
        }
    }
}

/// Canonical identifier of a cached detail, list or auxiliary entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(Vec<KeySegment>);

impl CacheKey {
    fn extend(mut self, segment: KeySegment) -> Self {
        self.0.push(segment);
        self
    }

    fn label(self, label: &str) -> Self {
        self.extend(KeySegment::Label(label.to_string()))
    }

    /// Fixed prefix unique per kind
    pub fn all(kind: EntityKind) -> Self {
        Self(vec![KeySegment::Kind(kind)])
    }

    /// Prefix shared by every list of `kind` that is not routed through a parent detail
    pub fn list(kind: EntityKind) -> Self {
        Self::all(kind).label(LIST)
    }

    pub fn detail(kind: EntityKind, id: i64) -> Self {
        Self::all(kind).label(DETAIL).extend(KeySegment::Id(id))
    }

    /// List view for one filter scope
    ///
    /// Workflow-step filters carrying a `workflow_id` (or else a `command_id`)
    /// are nested under that parent's detail key.
    pub fn filtered_list(kind: EntityKind, filter: &FilterScope) -> Self {
        if kind == EntityKind::WorkflowStep {
            if let Some(workflow_id) = filter.workflow_id {
                return Self::nested_steps(
                    Self::detail(EntityKind::Workflow, workflow_id),
                    filter.without(FilterField::WorkflowId),
                );
            }
            if let Some(command_id) = filter.command_id {
                return Self::nested_steps(
                    Self::detail(EntityKind::Command, command_id),
                    filter.without(FilterField::CommandId),
                );
            }
        }
        Self::list(kind).extend(KeySegment::Filter(filter.normalize()))
    }

    fn nested_steps(parent: Self, rest: FilterScope) -> Self {
        parent
            .extend(KeySegment::Kind(EntityKind::WorkflowStep))
            .label(LIST)
            .extend(KeySegment::Filter(rest.normalize()))
    }

    /// Prefix of every step list nested under one workflow or command
    pub fn nested_step_lists(parent_kind: EntityKind, parent_id: i64) -> Self {
        Self::detail(parent_kind, parent_id)
            .extend(KeySegment::Kind(EntityKind::WorkflowStep))
            .label(LIST)
    }

    pub fn step_count(workflow_id: i64) -> Self {
        Self::detail(EntityKind::Workflow, workflow_id).label(WORKFLOW_STEP_COUNT)
    }

    /// Steps joined with their commands, for one workflow
    pub fn populated_steps(workflow_id: i64, enabled_only: Option<bool>) -> Self {
        let filter = FilterScope {
            workflow_id: Some(workflow_id),
            enabled_only,
            ..FilterScope::default()
        };
        Self::filtered_list(EntityKind::WorkflowStep, &filter).label(COMMAND_POPULATED_STEP)
    }

    pub fn category_command_count(category_id: i64) -> Self {
        Self::detail(EntityKind::Category, category_id).label(CATEGORY_COMMAND_COUNT)
    }

    pub fn category_workflow_count(category_id: i64) -> Self {
        Self::detail(EntityKind::Category, category_id).label(CATEGORY_WORKFLOW_COUNT)
    }

    pub fn group_tree(group_id: i64) -> Self {
        Self::detail(EntityKind::Group, group_id).label(GROUP_TREE)
    }

    pub fn group_path(group_id: i64) -> Self {
        Self::detail(EntityKind::Group, group_id).label(GROUP_PATH)
    }

    pub fn command_search(term: &str) -> Self {
        Self::list(EntityKind::Command)
            .label(SEARCH)
            .extend(KeySegment::Text(term.to_string()))
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// `Some((kind, id))` when this is exactly a detail key
    pub fn detail_of(&self) -> Option<(EntityKind, i64)> {
        match self.0.as_slice() {
            [KeySegment::Kind(kind), KeySegment::Label(label), KeySegment::Id(id)]
                if label == DETAIL =>
            {
                Some((*kind, *id))
            }
            _ => None,
        }
    }

    /// Entity kind held by the list this key names, if it names a list
    ///
    /// The innermost `Kind` segment decides; it must be followed by the
    /// `list` label.
    pub fn list_kind(&self) -> Option<EntityKind> {
        let position = self
            .0
            .iter()
            .rposition(|segment| matches!(segment, KeySegment::Kind(_)))?;
        match (self.0.get(position), self.0.get(position + 1)) {
            (Some(KeySegment::Kind(kind)), Some(KeySegment::Label(label))) if label == LIST => {
                Some(*kind)
            }
            _ => None,
        }
    }

    /// Normalized filter of a list key, including the parent id a nested
    /// step list is routed through
    pub fn filter(&self) -> Option<FilterScope> {
        self.list_kind()?;
        let mut scope = self
            .0
            .iter()
            .find_map(|segment| match segment {
                KeySegment::Filter(filter) => Some(filter.to_scope()),
                _ => None,
            })
            .unwrap_or_default();

        if let [KeySegment::Kind(parent), KeySegment::Label(label), KeySegment::Id(id), KeySegment::Kind(EntityKind::WorkflowStep), ..] =
            self.0.as_slice()
        {
            if label == DETAIL {
                match parent {
                    EntityKind::Workflow => scope.workflow_id = Some(*id),
                    EntityKind::Command => scope.command_id = Some(*id),
                    _ => {}
                }
            }
        }
        Some(scope)
    }

    /// Whether this list key holds auxiliary data (search results, populated
    /// steps) rather than the plain entity list of its filter
    pub fn is_auxiliary_list(&self) -> bool {
        matches!(
            self.0.last(),
            Some(KeySegment::Label(label)) if label == COMMAND_POPULATED_STEP
        ) || self
            .0
            .iter()
            .any(|segment| matches!(segment, KeySegment::Label(label) if label == SEARCH))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", segment)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FilterValue, EntityKind::*};

    #[test]
    fn test_prefixes_are_unique_per_kind() {
        for a in EntityKind::ALL {
            for b in EntityKind::ALL {
                if a != b {
                    assert!(!CacheKey::detail(a, 1).starts_with(&CacheKey::all(b)));
                }
            }
        }
    }

    #[test]
    fn test_list_and_detail_share_kind_prefix() {
        let all = CacheKey::all(Command);
        assert!(CacheKey::list(Command).starts_with(&all));
        assert!(CacheKey::detail(Command, 3).starts_with(&all));
        assert!(CacheKey::filtered_list(Command, &FilterScope::parent(1))
            .starts_with(&CacheKey::list(Command)));
        assert_eq!(CacheKey::detail(Command, 3).to_string(), "[commands, detail, 3]");
    }

    #[test]
    fn test_filtered_list_is_order_independent() {
        let a = FilterScope::from_fields([
            (FilterField::CategoryId, Some(FilterValue::Id(9))),
            (FilterField::FavoritesOnly, Some(FilterValue::Flag(true))),
        ])
        .unwrap();
        let b = FilterScope::from_fields([
            (FilterField::FavoritesOnly, Some(FilterValue::Flag(true))),
            (FilterField::CategoryId, Some(FilterValue::Id(9))),
        ])
        .unwrap();

        assert_eq!(
            CacheKey::filtered_list(Group, &a),
            CacheKey::filtered_list(Group, &b)
        );
    }

    #[test]
    fn test_step_lists_route_through_parent_detail() {
        let by_workflow = CacheKey::filtered_list(WorkflowStep, &FilterScope::workflow(5));
        assert!(by_workflow.starts_with(&CacheKey::detail(Workflow, 5)));
        assert_eq!(by_workflow.list_kind(), Some(WorkflowStep));
        assert_eq!(by_workflow.filter(), Some(FilterScope::workflow(5)));

        let by_command = CacheKey::filtered_list(WorkflowStep, &FilterScope::command(8));
        assert!(by_command.starts_with(&CacheKey::detail(Command, 8)));
        assert_eq!(by_command.filter(), Some(FilterScope::command(8)));

        let both = FilterScope {
            workflow_id: Some(5),
            command_id: Some(8),
            ..Default::default()
        };
        let key = CacheKey::filtered_list(WorkflowStep, &both);
        assert!(key.starts_with(&CacheKey::detail(Workflow, 5)));
        assert_eq!(key.filter(), Some(both));
    }

    #[test]
    fn test_unrouted_step_list_stays_under_list_prefix() {
        let enabled = FilterScope {
            enabled_only: Some(true),
            ..Default::default()
        };
        let key = CacheKey::filtered_list(WorkflowStep, &enabled);
        assert!(key.starts_with(&CacheKey::list(WorkflowStep)));
    }

    #[test]
    fn test_classification() {
        assert_eq!(CacheKey::detail(Group, 2).detail_of(), Some((Group, 2)));
        assert_eq!(CacheKey::group_tree(2).detail_of(), None);
        assert_eq!(CacheKey::group_tree(2).list_kind(), None);
        assert_eq!(CacheKey::step_count(4).list_kind(), None);
        assert_eq!(CacheKey::list(Category).list_kind(), Some(Category));
        assert!(CacheKey::populated_steps(4, None).is_auxiliary_list());
        assert!(CacheKey::command_search("git").is_auxiliary_list());
        assert!(!CacheKey::filtered_list(Command, &FilterScope::root()).is_auxiliary_list());
    }
}
