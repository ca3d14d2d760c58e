//! Invalidation Propagator
//!
//! One declarative cascade table decides which cache entries a settled
//! mutation makes stale, and which it removes outright. Only deletes remove
//! entries; everything else marks them stale so the next read refetches.
//!
//! | Mutation | Direct | Cascade |
//! |---|---|---|
//! | any Command change | command detail, command lists | category command counts; delete drops its step lists and steps |
//! | delete Group | group detail, tree, path, group lists | command and group lists scoped to the group |
//! | other Group change | group detail, group lists | every group tree and path |
//! | delete Category | category detail, category lists | command, group and workflow lists filtered by the category |
//! | any Workflow change | workflow detail, workflow lists | category workflow counts; delete drops its step lists and steps |
//! | any WorkflowStep change | step detail, step lists under its workflow and command, general step lists | workflow step count |
//! | toggle favorite | entity detail, general lists | none |
//!
//! When the relations of the changed entity are unknown, cascades widen to
//! every entry of the affected family.

use crate::cache::{key, CacheKey, CacheState, CachedValue, KeySegment};
use crate::models::{Entity, EntityKind, FilterField, FilterValue};

/// What kind of mutation settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Move,
    ToggleFavorite,
    ToggleEnabled,
}

/// Cross-references of the changed entity that cascades follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Relations {
    pub parent_id: Option<i64>,
    pub category_id: Option<i64>,
    pub workflow_id: Option<i64>,
    pub command_id: Option<i64>,
}

impl From<&Entity> for Relations {
    fn from(entity: &Entity) -> Self {
        match entity {
            Entity::WorkflowStep(step) => Self {
                workflow_id: Some(step.workflow_id),
                command_id: Some(step.command_id),
                ..Self::default()
            },
            other => Self {
                parent_id: other.scope_parent(),
                category_id: other.category_id(),
                ..Self::default()
            },
        }
    }
}

/// A settled mutation, as seen by the propagator
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: EntityKind,
    pub mutation: MutationKind,
    pub id: i64,
    /// Relations before and after the change; empty when unknown
    pub relations: Vec<Relations>,
}

impl Change {
    pub fn new(kind: EntityKind, mutation: MutationKind, id: i64) -> Self {
        Self {
            kind,
            mutation,
            id,
            relations: Vec::new(),
        }
    }

    pub fn with_relations(mut self, entity: &Entity) -> Self {
        let relations = Relations::from(entity);
        if !self.relations.contains(&relations) {
            self.relations.push(relations);
        }
        self
    }

    fn known(&self) -> bool {
        !self.relations.is_empty()
    }

    fn each<T>(&self, pick: impl Fn(&Relations) -> Option<T>) -> Vec<T> {
        self.relations.iter().filter_map(pick).collect()
    }
}

/// Family of cache entries targeted by one cascade rule
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationTarget {
    /// Exactly this key
    Exact(CacheKey),
    /// This key and everything below it
    Prefix(CacheKey),
    /// Every list holding `kind`, wherever it is nested
    ListsOf(EntityKind),
    /// Lists of `kind` whose filter has `field == id`
    ListsFiltered {
        kind: EntityKind,
        field: FilterField,
        id: i64,
    },
    /// Auxiliary entries named `label` under any detail key of `owner`
    Auxiliary {
        owner: EntityKind,
        label: &'static str,
    },
    /// Detail entries of `kind` whose cached entity references `id` through `field`
    Referencing {
        kind: EntityKind,
        field: FilterField,
        id: i64,
    },
}

impl InvalidationTarget {
    pub fn matches(&self, key: &CacheKey, value: Option<&CachedValue>) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix),
            Self::ListsOf(kind) => key.list_kind() == Some(*kind),
            Self::ListsFiltered { kind, field, id } => {
                key.list_kind() == Some(*kind)
                    && key
                        .filter()
                        .is_some_and(|filter| filter.get(*field) == Some(FilterValue::Id(*id)))
            }
            Self::Auxiliary { owner, label } => {
                let segments = key.segments();
                segments.len() == 4
                    && key.starts_with(&CacheKey::all(*owner))
                    && matches!(segments.last(), Some(KeySegment::Label(last)) if last == label)
            }
            Self::Referencing { kind, field, id } => {
                let Some((detail_kind, _)) = key.detail_of() else {
                    return false;
                };
                let Some(CachedValue::Entity(entity)) = value else {
                    return false;
                };
                detail_kind == *kind && references(entity, *field, *id)
            }
        }
    }
}

fn references(entity: &Entity, field: FilterField, id: i64) -> bool {
    match (field, entity) {
        (FilterField::ParentId, e) => e.scope_parent() == Some(id),
        (FilterField::CategoryId, e) => e.category_id() == Some(id),
        (FilterField::WorkflowId, Entity::WorkflowStep(step)) => step.workflow_id == id,
        (FilterField::CommandId, Entity::WorkflowStep(step)) => step.command_id == id,
        _ => false,
    }
}

/// Keys to remove and keys to mark stale after a mutation settles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationPlan {
    pub remove: Vec<InvalidationTarget>,
    pub invalidate: Vec<InvalidationTarget>,
}

/// Keys actually touched when a plan was applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedPlan {
    pub removed: Vec<CacheKey>,
    pub invalidated: Vec<CacheKey>,
}

impl InvalidationPlan {
    fn remove(&mut self, target: InvalidationTarget) {
        self.remove.push(target);
    }

    fn invalidate(&mut self, target: InvalidationTarget) {
        self.invalidate.push(target);
    }

    /// Remove first, then mark the rest stale
    pub fn apply(&self, state: &mut CacheState) -> AppliedPlan {
        let removed = self.matching(state, &self.remove);
        state.remove_where(|key| removed.contains(key));

        let invalidated = self.matching(state, &self.invalidate);
        state.invalidate_where(|key| invalidated.contains(key));

        AppliedPlan {
            removed,
            invalidated,
        }
    }

    fn matching(&self, state: &CacheState, targets: &[InvalidationTarget]) -> Vec<CacheKey> {
        state
            .keys_where(|_| true)
            .into_iter()
            .filter(|key| {
                let value = state.get(key);
                targets.iter().any(|target| target.matches(key, value))
            })
            .collect()
    }

    /// Whether the plan would touch `key` (holding `value`)
    pub fn covers(&self, key: &CacheKey, value: Option<&CachedValue>) -> bool {
        self.remove
            .iter()
            .chain(self.invalidate.iter())
            .any(|target| target.matches(key, value))
    }
}

/// Turns settled mutations into invalidation plans
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationPropagator;

impl InvalidationPropagator {
    pub fn plan(&self, change: &Change) -> InvalidationPlan {
        use InvalidationTarget::*;

        let mut plan = InvalidationPlan::default();
        let kind = change.kind;
        let detail = CacheKey::detail(kind, change.id);

        if change.mutation == MutationKind::ToggleFavorite {
            plan.invalidate(Exact(detail));
            plan.invalidate(Prefix(CacheKey::list(kind)));
            return plan;
        }

        let deleting = change.mutation == MutationKind::Delete;
        if deleting {
            plan.remove(Prefix(detail));
        } else {
            plan.invalidate(Prefix(detail));
        }

        match kind {
            EntityKind::Command => {
                plan.invalidate(ListsOf(EntityKind::Command));
                self.category_counts(
                    &mut plan,
                    change,
                    CacheKey::category_command_count,
                    key::CATEGORY_COMMAND_COUNT,
                );
                if deleting {
                    plan.remove(Referencing {
                        kind: EntityKind::WorkflowStep,
                        field: FilterField::CommandId,
                        id: change.id,
                    });
                    plan.invalidate(ListsOf(EntityKind::WorkflowStep));
                    plan.invalidate(Auxiliary {
                        owner: EntityKind::Workflow,
                        label: key::WORKFLOW_STEP_COUNT,
                    });
                }
            }
            EntityKind::Group => {
                plan.invalidate(ListsOf(EntityKind::Group));
                plan.invalidate(Auxiliary {
                    owner: EntityKind::Group,
                    label: key::GROUP_TREE,
                });
                plan.invalidate(Auxiliary {
                    owner: EntityKind::Group,
                    label: key::GROUP_PATH,
                });
                if deleting {
                    for child in [EntityKind::Command, EntityKind::Group] {
                        plan.remove(ListsFiltered {
                            kind: child,
                            field: FilterField::ParentId,
                            id: change.id,
                        });
                        plan.invalidate(Referencing {
                            kind: child,
                            field: FilterField::ParentId,
                            id: change.id,
                        });
                    }
                    plan.invalidate(ListsOf(EntityKind::Command));
                }
            }
            EntityKind::Category => {
                plan.invalidate(ListsOf(EntityKind::Category));
                if deleting {
                    for referencing in [
                        EntityKind::Command,
                        EntityKind::Group,
                        EntityKind::Workflow,
                    ] {
                        plan.invalidate(ListsFiltered {
                            kind: referencing,
                            field: FilterField::CategoryId,
                            id: change.id,
                        });
                        plan.invalidate(Referencing {
                            kind: referencing,
                            field: FilterField::CategoryId,
                            id: change.id,
                        });
                    }
                }
            }
            EntityKind::Workflow => {
                plan.invalidate(ListsOf(EntityKind::Workflow));
                self.category_counts(
                    &mut plan,
                    change,
                    CacheKey::category_workflow_count,
                    key::CATEGORY_WORKFLOW_COUNT,
                );
                if deleting {
                    plan.remove(Referencing {
                        kind: EntityKind::WorkflowStep,
                        field: FilterField::WorkflowId,
                        id: change.id,
                    });
                    plan.invalidate(ListsOf(EntityKind::WorkflowStep));
                }
            }
            EntityKind::WorkflowStep => {
                plan.invalidate(Prefix(CacheKey::list(EntityKind::WorkflowStep)));
                if change.known() {
                    for workflow_id in change.each(|r| r.workflow_id) {
                        plan.invalidate(Prefix(CacheKey::nested_step_lists(
                            EntityKind::Workflow,
                            workflow_id,
                        )));
                        plan.invalidate(Exact(CacheKey::step_count(workflow_id)));
                    }
                    for command_id in change.each(|r| r.command_id) {
                        plan.invalidate(Prefix(CacheKey::nested_step_lists(
                            EntityKind::Command,
                            command_id,
                        )));
                    }
                } else {
                    plan.invalidate(ListsOf(EntityKind::WorkflowStep));
                    plan.invalidate(Auxiliary {
                        owner: EntityKind::Workflow,
                        label: key::WORKFLOW_STEP_COUNT,
                    });
                }
            }
        }

        plan
    }

    fn category_counts(
        &self,
        plan: &mut InvalidationPlan,
        change: &Change,
        key: fn(i64) -> CacheKey,
        label: &'static str,
    ) {
        if change.known() {
            for category_id in change.each(|r| r.category_id) {
                plan.invalidate(InvalidationTarget::Exact(key(category_id)));
            }
        } else {
            plan.invalidate(InvalidationTarget::Auxiliary {
                owner: EntityKind::Category,
                label,
            });
        }
    }
}

#[cfg(test)]
#[path = "invalidation_test.rs"]
mod invalidation_test;
