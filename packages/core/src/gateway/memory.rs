//! In-Memory Gateway
//!
//! Authoritative reference implementation of [`EntityGateway`] that keeps
//! every entity in process memory. It enforces the same rules as the real
//! backend so that cache behavior can be exercised end to end:
//!
//! - positions are gap-based, moves take the midpoint of their neighbors and
//!   exhausted gaps renumber the scope
//! - move neighbors must share the moved entity's scope (`INVALID_DATA`)
//! - group parents may not form a cycle (`CIRCULAR_REFERENCE`)
//! - references must exist (`FOREIGN_KEY_VIOLATION`)
//! - deletes cascade: a deleted group un-scopes its commands and child
//!   groups, a deleted category clears references to it, a deleted workflow
//!   or command takes its steps with it
//!
//! Tests can inject failures with [`InMemoryGateway::fail_next`] and slow
//! operations down with [`InMemoryGateway::set_latency`].

use crate::config::{ConfigError, OrderingConfig};
use crate::gateway::{CountQuery, EntityGateway, GatewayError, GatewayResult, Operation};
use crate::models::{
    Command, Entity, EntityKind, EntityPatch, FilterScope, Group, MoveRequest, WorkflowStep,
    DRAFT_ID,
};
use crate::ordering::{sibling_scope, OrderingError, ReorderEngine};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    entities: BTreeMap<EntityKind, BTreeMap<i64, Entity>>,
    next_id: BTreeMap<EntityKind, i64>,
    failures: HashMap<Operation, VecDeque<GatewayError>>,
    latency: HashMap<Operation, Duration>,
    calls: HashMap<Operation, usize>,
}

impl MemoryState {
    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.get(&kind).into_iter().flat_map(|table| table.values())
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<i64, Entity> {
        self.entities.entry(kind).or_default()
    }

    fn find(&self, kind: EntityKind, id: i64) -> Option<&Entity> {
        self.entities.get(&kind).and_then(|table| table.get(&id))
    }

    fn require(&self, kind: EntityKind, id: i64) -> GatewayResult<&Entity> {
        self.find(kind, id)
            .ok_or_else(|| GatewayError::not_found(kind.singular(), id))
    }

    fn allocate_id(&mut self, kind: EntityKind) -> i64 {
        let next = self.next_id.entry(kind).or_insert(0);
        *next += 1;
        *next
    }

    /// Entities of `kind` in `filter`, in display order
    fn list(&self, kind: EntityKind, filter: &FilterScope) -> Vec<Entity> {
        let mut items: Vec<Entity> = self
            .table(kind)
            .filter(|entity| matches_filter(entity, filter))
            .cloned()
            .collect();
        sort_display_order(&mut items);
        items
    }

    /// Siblings sharing `entity`'s ordering scope, excluding itself
    fn siblings(&self, entity: &Entity) -> Vec<Entity> {
        let scope = sibling_scope(entity);
        let mut items: Vec<Entity> = self
            .table(entity.kind())
            .filter(|other| other.id() != entity.id() && sibling_scope(other) == scope)
            .cloned()
            .collect();
        sort_display_order(&mut items);
        items
    }

    fn check_references(&self, entity: &Entity) -> GatewayResult<()> {
        let reference = |kind: EntityKind, field: &str, id: Option<i64>| match id {
            Some(id) if self.find(kind, id).is_none() => Err(GatewayError::foreign_key(field, id)),
            _ => Ok(()),
        };

        reference(EntityKind::Category, "category_id", entity.category_id())?;
        match entity {
            Entity::Command(command) => reference(EntityKind::Group, "group_id", command.group_id),
            Entity::Group(group) => {
                reference(EntityKind::Group, "parent_group_id", group.parent_group_id)?;
                if let Some(parent_id) = group.parent_group_id {
                    self.check_no_cycle(group.id, parent_id)?;
                }
                Ok(())
            }
            Entity::WorkflowStep(step) => {
                reference(EntityKind::Workflow, "workflow_id", Some(step.workflow_id))?;
                reference(EntityKind::Command, "command_id", Some(step.command_id))
            }
            Entity::Category(_) | Entity::Workflow(_) => Ok(()),
        }
    }

    fn check_no_cycle(&self, group_id: i64, parent_id: i64) -> GatewayResult<()> {
        let mut current = Some(parent_id);
        let mut hops = 0;
        while let Some(id) = current {
            if id == group_id || hops > self.table(EntityKind::Group).count() {
                return Err(GatewayError::circular_reference(group_id, parent_id));
            }
            current = match self.find(EntityKind::Group, id) {
                Some(Entity::Group(group)) => group.parent_group_id,
                _ => None,
            };
            hops += 1;
        }
        Ok(())
    }

    fn validate(entity: &Entity) -> GatewayResult<()> {
        if !matches!(entity, Entity::WorkflowStep(_)) && entity.name().trim().is_empty() {
            return Err(GatewayError::invalid_data("name", "must not be empty"));
        }
        if let Entity::Command(command) = entity {
            if command.command.trim().is_empty() {
                return Err(GatewayError::invalid_data("command", "must not be empty"));
            }
        }
        Ok(())
    }

    /// Honor a requested position if it is positive and free, else append
    fn placement(&self, entity: &Entity, engine: &ReorderEngine) -> f64 {
        let siblings = self.siblings(entity);
        let requested = entity.position();
        let free = siblings.iter().all(|sibling| sibling.position() != requested);
        if requested > 0.0 && free {
            requested
        } else {
            engine.append_position(siblings.iter().map(Entity::position))
        }
    }

    /// Move every member of a deleted parent's scope to the end of the root scope
    fn unscope_children(&mut self, kind: EntityKind, parent_id: i64, engine: &ReorderEngine) {
        let mut orphans: Vec<Entity> = self
            .table(kind)
            .filter(|entity| entity.scope_parent() == Some(parent_id))
            .cloned()
            .collect();
        sort_display_order(&mut orphans);

        for mut orphan in orphans {
            match &mut orphan {
                Entity::Command(command) => command.group_id = None,
                Entity::Group(group) => group.parent_group_id = None,
                _ => continue,
            }
            let position = engine.append_position(self.siblings(&orphan).iter().map(Entity::position));
            orphan.set_position(position);
            self.table_mut(kind).insert(orphan.id(), orphan);
        }
    }

    fn clear_category(&mut self, category_id: i64) {
        for kind in [EntityKind::Command, EntityKind::Group, EntityKind::Workflow] {
            for entity in self.table_mut(kind).values_mut() {
                match entity {
                    Entity::Command(c) if c.category_id == Some(category_id) => c.category_id = None,
                    Entity::Group(g) if g.category_id == Some(category_id) => g.category_id = None,
                    Entity::Workflow(w) if w.category_id == Some(category_id) => w.category_id = None,
                    _ => {}
                }
            }
        }
    }

    fn remove_steps(&mut self, predicate: impl Fn(&WorkflowStep) -> bool) {
        self.table_mut(EntityKind::WorkflowStep).retain(|_, entity| match entity {
            Entity::WorkflowStep(step) => !predicate(step),
            _ => true,
        });
    }
}

fn sort_display_order(items: &mut [Entity]) {
    items.sort_by(|a, b| {
        a.position()
            .total_cmp(&b.position())
            .then(a.id().cmp(&b.id()))
    });
}

/// Whether `entity` belongs to the list view `filter`
///
/// Commands and groups are scoped by parent even when no parent is given:
/// the unfiltered list holds root-level entries only.
fn matches_filter(entity: &Entity, filter: &FilterScope) -> bool {
    if filter.is_favorites_only() && !entity.is_favorite() {
        return false;
    }
    match entity {
        Entity::Command(_) | Entity::Group(_) => {
            entity.scope_parent() == filter.parent_id
                && filter.category_id.map_or(true, |id| entity.category_id() == Some(id))
        }
        Entity::Workflow(workflow) => filter
            .category_id
            .map_or(true, |id| workflow.category_id == Some(id)),
        Entity::WorkflowStep(step) => {
            filter.workflow_id.map_or(true, |id| step.workflow_id == id)
                && filter.command_id.map_or(true, |id| step.command_id == id)
                && (filter.enabled_only != Some(true) || step.enabled)
        }
        Entity::Category(_) => true,
    }
}

fn ordering_error(error: OrderingError, state: &MemoryState) -> GatewayError {
    match error {
        OrderingError::NeighborNotInScope { kind, neighbor, .. }
            if state.find(kind, neighbor).is_none() =>
        {
            GatewayError::not_found(kind.singular(), neighbor)
        }
        OrderingError::NeighborNotInScope { .. } => GatewayError::invalid_data(
            "parent_id",
            "all siblings of a move must share the same parent",
        ),
        other => GatewayError::invalid_data("position", other.to_string()),
    }
}

/// Authoritative in-process entity store
pub struct InMemoryGateway {
    state: Mutex<MemoryState>,
    engine: ReorderEngine,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::with_engine(ReorderEngine::default())
    }

    pub fn with_ordering(config: OrderingConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_engine(ReorderEngine::new(config)?))
    }

    fn with_engine(engine: ReorderEngine) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            engine,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entity as-is, keeping its position; drafts get a fresh id
    ///
    /// Seeding helper that bypasses validation, returns the stored id.
    pub fn insert(&self, entity: impl Into<Entity>) -> i64 {
        let mut entity = entity.into();
        let mut state = self.lock();
        let kind = entity.kind();
        if entity.is_draft() {
            let id = state.allocate_id(kind);
            entity.set_id(id);
        } else {
            let next = state.next_id.entry(kind).or_insert(0);
            *next = (*next).max(entity.id());
        }
        let id = entity.id();
        state.table_mut(kind).insert(id, entity);
        id
    }

    /// Authoritative copy of one entity
    pub fn entity(&self, kind: EntityKind, id: i64) -> Option<Entity> {
        self.lock().find(kind, id).cloned()
    }

    /// Every entity of `kind`, ordered by id
    pub fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.lock().table(kind).cloned().collect()
    }

    /// Fail the next call of `operation` with `error`; queued errors are used in order
    pub fn fail_next(&self, operation: Operation, error: GatewayError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Delay every call of `operation` by `latency`
    pub fn set_latency(&self, operation: Operation, latency: Duration) {
        self.lock().latency.insert(operation, latency);
    }

    /// Number of calls made to `operation` so far
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Count the call, apply latency, then surface any injected failure
    async fn enter(&self, operation: Operation) -> GatewayResult<()> {
        let (latency, failure) = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            let failure = state
                .failures
                .get_mut(&operation)
                .and_then(VecDeque::pop_front);
            (state.latency.get(&operation).copied(), failure)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => {
                tracing::debug!("Injected failure for {}: {}", operation, error);
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EntityGateway for InMemoryGateway {
    async fn get(&self, kind: EntityKind, id: i64) -> GatewayResult<Entity> {
        self.enter(Operation::Get).await?;
        self.lock().require(kind, id).cloned()
    }

    async fn list(&self, kind: EntityKind, filter: &FilterScope) -> GatewayResult<Vec<Entity>> {
        self.enter(Operation::List).await?;
        Ok(self.lock().list(kind, filter))
    }

    async fn create(&self, entity: &Entity) -> GatewayResult<i64> {
        self.enter(Operation::Create).await?;
        if !entity.is_draft() {
            return Err(GatewayError::invalid_data(
                "id",
                format!("create requires id {}, got {}", DRAFT_ID, entity.id()),
            ));
        }
        MemoryState::validate(entity)?;

        let mut state = self.lock();
        state.check_references(entity)?;

        let mut stored = entity.clone();
        let position = state.placement(&stored, &self.engine);
        stored.set_position(position);
        let id = state.allocate_id(stored.kind());
        stored.set_id(id);
        stored.set_timestamps(&Utc::now().to_rfc3339(), true);

        tracing::debug!("Created {} {} at position {}", stored.kind().singular(), id, position);
        state.table_mut(stored.kind()).insert(id, stored);
        Ok(id)
    }

    async fn update(&self, id: i64, patch: &EntityPatch) -> GatewayResult<()> {
        self.enter(Operation::Update).await?;
        let kind = patch.kind();
        let mut state = self.lock();
        let current = state.require(kind, id)?.clone();

        let mut updated = current.clone();
        patch.apply(&mut updated);
        MemoryState::validate(&updated)?;
        state.check_references(&updated)?;

        if sibling_scope(&updated) != sibling_scope(&current) {
            let position = self
                .engine
                .append_position(state.siblings(&updated).iter().map(Entity::position));
            updated.set_position(position);
        }
        updated.set_timestamps(&Utc::now().to_rfc3339(), false);
        state.table_mut(kind).insert(id, updated);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> GatewayResult<()> {
        self.enter(Operation::Delete).await?;
        let mut state = self.lock();
        state.require(kind, id)?;
        state.table_mut(kind).remove(&id);

        match kind {
            EntityKind::Group => {
                state.unscope_children(EntityKind::Command, id, &self.engine);
                state.unscope_children(EntityKind::Group, id, &self.engine);
            }
            EntityKind::Category => state.clear_category(id),
            EntityKind::Workflow => state.remove_steps(|step| step.workflow_id == id),
            EntityKind::Command => state.remove_steps(|step| step.command_id == id),
            EntityKind::WorkflowStep => {}
        }
        tracing::debug!("Deleted {} {}", kind.singular(), id);
        Ok(())
    }

    async fn move_between(&self, kind: EntityKind, request: MoveRequest) -> GatewayResult<()> {
        self.enter(Operation::Move).await?;
        let mut state = self.lock();
        let moved = state.require(kind, request.id)?.clone();
        let siblings = state.siblings(&moved);

        let plan = self
            .engine
            .plan_move(&moved, &siblings, request)
            .map_err(|e| ordering_error(e, &state))?;

        let table = state.table_mut(kind);
        for (sibling, position) in &plan.renumbered {
            if let Some(entity) = table.get_mut(sibling) {
                entity.set_position(*position);
            }
        }
        if let Some(entity) = table.get_mut(&request.id) {
            entity.set_position(plan.position);
        }
        tracing::info!("{} {} position updated", kind.singular(), request.id);
        Ok(())
    }

    async fn toggle_favorite(&self, kind: EntityKind, id: i64) -> GatewayResult<()> {
        self.enter(Operation::ToggleFavorite).await?;
        let mut state = self.lock();
        state.require(kind, id)?;
        if let Some(entity) = state.table_mut(kind).get_mut(&id) {
            entity.set_favorite(!entity.is_favorite());
        }
        Ok(())
    }

    async fn toggle_enabled(&self, step_id: i64) -> GatewayResult<()> {
        self.enter(Operation::ToggleEnabled).await?;
        let mut state = self.lock();
        state.require(EntityKind::WorkflowStep, step_id)?;
        if let Some(Entity::WorkflowStep(step)) =
            state.table_mut(EntityKind::WorkflowStep).get_mut(&step_id)
        {
            step.enabled = !step.enabled;
        }
        Ok(())
    }

    async fn count(&self, query: CountQuery) -> GatewayResult<i64> {
        self.enter(Operation::Count).await?;
        let state = self.lock();
        let count = match query {
            CountQuery::WorkflowSteps(id) => state
                .table(EntityKind::WorkflowStep)
                .filter(|e| e.scope_parent() == Some(id))
                .count(),
            CountQuery::CategoryCommands(id) => state
                .table(EntityKind::Command)
                .filter(|e| e.category_id() == Some(id))
                .count(),
            CountQuery::CategoryWorkflows(id) => state
                .table(EntityKind::Workflow)
                .filter(|e| e.category_id() == Some(id))
                .count(),
        };
        Ok(count as i64)
    }

    async fn group_tree(&self, root_id: i64) -> GatewayResult<Vec<Group>> {
        self.enter(Operation::GroupTree).await?;
        let state = self.lock();
        state.require(EntityKind::Group, root_id)?;

        let mut members = vec![root_id];
        let mut index = 0;
        while index < members.len() {
            let parent = members[index];
            members.extend(
                state
                    .table(EntityKind::Group)
                    .filter(|e| e.scope_parent() == Some(parent))
                    .map(Entity::id),
            );
            index += 1;
        }

        let mut tree: Vec<Group> = members
            .into_iter()
            .filter_map(|id| match state.find(EntityKind::Group, id) {
                Some(Entity::Group(group)) => Some(group.clone()),
                _ => None,
            })
            .collect();
        tree.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        Ok(tree)
    }

    async fn group_path(&self, group_id: i64) -> GatewayResult<Vec<String>> {
        self.enter(Operation::GroupPath).await?;
        let state = self.lock();
        state.require(EntityKind::Group, group_id)?;

        let mut path = Vec::new();
        let mut current = Some(group_id);
        while let Some(id) = current {
            let Some(Entity::Group(group)) = state.find(EntityKind::Group, id) else {
                break;
            };
            path.push(group.name.clone());
            current = group.parent_group_id;
        }
        path.reverse();
        Ok(path)
    }

    async fn steps_with_commands(
        &self,
        workflow_id: i64,
        enabled_only: bool,
    ) -> GatewayResult<Vec<(WorkflowStep, Command)>> {
        self.enter(Operation::StepsWithCommands).await?;
        let state = self.lock();
        let filter = FilterScope {
            workflow_id: Some(workflow_id),
            enabled_only: Some(enabled_only),
            ..FilterScope::default()
        };

        Ok(state
            .list(EntityKind::WorkflowStep, &filter)
            .into_iter()
            .filter_map(|entity| {
                let Entity::WorkflowStep(step) = entity else {
                    return None;
                };
                match state.find(EntityKind::Command, step.command_id) {
                    Some(Entity::Command(command)) => Some((step, command.clone())),
                    _ => None,
                }
            })
            .collect())
    }

    async fn search_commands(&self, term: &str) -> GatewayResult<Vec<Command>> {
        self.enter(Operation::SearchCommands).await?;
        let needle = term.to_lowercase();
        let state = self.lock();

        let mut found: Vec<Command> = state
            .table(EntityKind::Command)
            .filter_map(|entity| match entity {
                Entity::Command(command) => Some(command),
                _ => None,
            })
            .filter(|command| {
                command.name.to_lowercase().contains(&needle)
                    || command.command.to_lowercase().contains(&needle)
                    || command
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.is_favorite
                .cmp(&a.is_favorite)
                .then(a.position.total_cmp(&b.position))
        });
        Ok(found)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;
