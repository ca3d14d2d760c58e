//! Optimistic Mutation Coordinator
//!
//! Every mutation goes through the same protocol against the shared cache:
//!
//! 1. Cancel in-flight reads of the target's detail key and of every list
//!    that may hold it, and hold those keys so no new read writes to them
//!    until the mutation settles
//! 2. Snapshot the detail key and every entry holding the target
//! 3. Apply the speculative write in place, keeping list order
//! 4. Call the gateway
//! 5. On success, mark touched lists stale and apply the invalidation plan
//! 6. On failure, restore the snapshot exactly and return the remote error
//! 7. Either way, mark the detail key and the general list stale
//!
//! Steps 1-3 and 5-7 each run inside a single cache transaction; the hold is
//! released in the second one, so reads that waited on it start against the
//! settled authority. A second
//! mutation on the same id snapshots the first one's optimistic state, so
//! rolling it back restores that state rather than the original. Mutations
//! are never retried.

use crate::cache::{CacheKey, CacheService, CacheState, CachedValue, ReadHold, Snapshot};
use crate::gateway::{EntityGateway, GatewayResult};
use crate::models::{Entity, EntityKind, EntityPatch, FilterScope, MoveRequest};
use crate::ordering::{sibling_scope, MovePlan, ReorderEngine};
use crate::services::error::{
    CoordinatorError, MutationFailure, MutationRequest, MutationResult,
};
use crate::services::invalidation::{
    Change, InvalidationPropagator, InvalidationTarget, MutationKind,
};
use std::sync::Arc;
use tracing::instrument;

/// Applies optimistic mutations on top of the shared query cache
#[derive(Clone)]
pub struct MutationCoordinator {
    cache: CacheService,
    gateway: Arc<dyn EntityGateway>,
    engine: ReorderEngine,
    propagator: InvalidationPropagator,
}

/// A mutation between its optimistic write and its settlement
struct Pending {
    snapshot: Snapshot,
    hold: ReadHold,
}

/// Keys and ids an optimistic write reaches beyond the target itself
#[derive(Default)]
struct Footprint {
    keys: Vec<CacheKey>,
    related: Vec<i64>,
}

impl MutationCoordinator {
    pub fn new(cache: CacheService, gateway: Arc<dyn EntityGateway>) -> Self {
        Self {
            cache,
            gateway,
            engine: ReorderEngine::default(),
            propagator: InvalidationPropagator,
        }
    }

    pub fn with_engine(mut self, engine: ReorderEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn gateway(&self) -> &Arc<dyn EntityGateway> {
        &self.gateway
    }

    /// Create a draft entity and return its new id
    ///
    /// Drafts are never inserted into lists. A draft without a position is
    /// appended after the last sibling of its cached scope list.
    #[instrument(skip_all, fields(kind = %entity.kind()))]
    pub async fn create(&self, entity: Entity) -> MutationResult<i64> {
        let request = MutationRequest::Create {
            entity: entity.clone(),
        };
        if !entity.is_draft() {
            return Err(MutationFailure::new(
                request,
                CoordinatorError::context(
                    "create",
                    format!("id {} is not a draft id", entity.id()),
                ),
            ));
        }
        tracing::debug!("Starting {}", request);

        let kind = entity.kind();
        let mut draft = entity;
        let pending = self.begin(kind, draft.id(), Footprint::default(), |state| {
            if draft.position() == 0.0 {
                let scope = CacheKey::filtered_list(kind, &sibling_scope(&draft));
                if let Some(CachedValue::List(siblings)) = state.get(&scope) {
                    let position = self
                        .engine
                        .append_position(siblings.iter().map(Entity::position));
                    draft.set_position(position);
                }
            }
        });

        let outcome = self.gateway.create(&draft).await;
        self.settle(request, pending, outcome, |state, id| {
            let mut created = draft.clone();
            created.set_id(*id);
            state.set(&CacheKey::detail(kind, *id), CachedValue::Entity(created.clone()));
            Change::new(kind, MutationKind::Create, *id).with_relations(&created)
        })
    }

    /// Merge `patch` into entity `(kind, id)`
    #[instrument(skip_all, fields(kind = %kind, id = id))]
    pub async fn update(
        &self,
        kind: EntityKind,
        id: i64,
        patch: EntityPatch,
    ) -> MutationResult<()> {
        let request = MutationRequest::Update {
            kind,
            id,
            patch: patch.clone(),
        };
        if patch.kind() != kind {
            return Err(MutationFailure::new(
                request,
                CoordinatorError::context(
                    "update",
                    format!(
                        "a {} patch cannot update a {}",
                        patch.kind().singular(),
                        kind.singular()
                    ),
                ),
            ));
        }
        self.require_persisted(&request)?;
        tracing::debug!("Starting {}", request);

        let mut before = None;
        let pending = self.begin(kind, id, Footprint::default(), |state| {
            before = state.find_entity(kind, id);
            patch_copies(state, kind, id, |_| false, &mut |entity| {
                patch.apply(entity);
            });
        });

        let outcome = self.gateway.update(id, &patch).await;
        self.settle(request, pending, outcome, |_, _| {
            let mut change = Change::new(kind, MutationKind::Update, id);
            if let Some(before) = &before {
                let mut after = before.clone();
                patch.apply(&mut after);
                change = change.with_relations(before).with_relations(&after);
            }
            change
        })
    }

    /// Delete entity `(kind, id)`
    ///
    /// The id leaves every cached list right away; its detail subtree is
    /// dropped once the authority confirms.
    #[instrument(skip_all, fields(kind = %kind, id = id))]
    pub async fn delete(&self, kind: EntityKind, id: i64) -> MutationResult<()> {
        let request = MutationRequest::Delete { kind, id };
        self.require_persisted(&request)?;
        tracing::debug!("Starting {}", request);

        let mut before = None;
        let pending = self.begin(kind, id, Footprint::default(), |state| {
            before = state.find_entity(kind, id);
            let detail = CacheKey::detail(kind, id);
            for key in state.keys_containing(kind, id) {
                if key != detail {
                    state.update(&key, |value| value.remove_entity(kind, id));
                }
            }
        });

        let outcome = self.gateway.delete(kind, id).await;
        self.settle(request, pending, outcome, |_, _| {
            let change = Change::new(kind, MutationKind::Delete, id);
            match &before {
                Some(before) => change.with_relations(before),
                None => change,
            }
        })
    }

    /// Move an entity between two siblings of its scope; returns the new position
    #[instrument(skip_all, fields(kind = %kind, id = request.id))]
    pub async fn move_between(
        &self,
        kind: EntityKind,
        request: MoveRequest,
    ) -> MutationResult<f64> {
        let mutation = MutationRequest::Move { kind, request };
        self.require_persisted(&mutation)?;
        tracing::debug!("Starting {}", mutation);

        let (moved, plan) = match self.plan_move(kind, request).await {
            Ok(planned) => planned,
            Err(error) => return Err(MutationFailure::new(mutation, error)),
        };
        let scope_key = CacheKey::filtered_list(kind, &sibling_scope(&moved));

        let footprint = Footprint {
            keys: plan.invalidate.clone(),
            related: plan.renumbered.iter().map(|(id, _)| *id).collect(),
        };
        let pending = self.begin(kind, request.id, footprint, |state| {
            for (sibling, position) in &plan.renumbered {
                patch_copies(state, kind, *sibling, |_| false, &mut |entity| {
                    entity.set_position(*position);
                });
            }
            patch_copies(state, kind, request.id, |_| false, &mut |entity| {
                entity.set_position(plan.position);
            });
            for key in state.keys_where(|key| {
                key.list_kind() == Some(kind) && !key.is_auxiliary_list()
            }) {
                let holds_moved = state
                    .get(&key)
                    .is_some_and(|value| value.contains(kind, request.id));
                if key == scope_key || holds_moved {
                    state.update(&key, sort_by_position);
                }
            }
        });

        let position = plan.position;
        let outcome = self
            .gateway
            .move_between(kind, request)
            .await
            .map(|()| position);
        self.settle(mutation, pending, outcome, |_, _| {
            Change::new(kind, MutationKind::Move, request.id).with_relations(&moved)
        })
    }

    /// Flip the favorite flag of `(kind, id)`
    ///
    /// Favorites-only lists are left alone and refetched once the toggle settles.
    #[instrument(skip_all, fields(kind = %kind, id = id))]
    pub async fn toggle_favorite(&self, kind: EntityKind, id: i64) -> MutationResult<()> {
        let request = MutationRequest::ToggleFavorite { kind, id };
        self.require_persisted(&request)?;
        tracing::debug!("Starting {}", request);

        let mut before = None;
        let pending = self.begin(kind, id, Footprint::default(), |state| {
            before = state.find_entity(kind, id);
            patch_copies(
                state,
                kind,
                id,
                |key| key.filter().is_some_and(|f| f.is_favorites_only()),
                &mut |entity| entity.set_favorite(!entity.is_favorite()),
            );
        });

        let outcome = self.gateway.toggle_favorite(kind, id).await;
        self.settle(request, pending, outcome, |_, _| {
            let change = Change::new(kind, MutationKind::ToggleFavorite, id);
            match &before {
                Some(before) => change.with_relations(before),
                None => change,
            }
        })
    }

    /// Flip the enabled flag of a workflow step
    ///
    /// Enabled-only lists change membership rather than fields, so they are
    /// refetched instead of patched.
    #[instrument(skip_all, fields(id = step_id))]
    pub async fn toggle_enabled(&self, step_id: i64) -> MutationResult<()> {
        let request = MutationRequest::ToggleEnabled { id: step_id };
        self.require_persisted(&request)?;
        tracing::debug!("Starting {}", request);

        let kind = EntityKind::WorkflowStep;
        let mut before = None;
        let pending = self.begin(kind, step_id, Footprint::default(), |state| {
            before = state.find_entity(kind, step_id);
            patch_copies(
                state,
                kind,
                step_id,
                |key| key.filter().is_some_and(|f| f.enabled_only == Some(true)),
                &mut |entity| {
                    if let Entity::WorkflowStep(step) = entity {
                        step.enabled = !step.enabled;
                    }
                },
            );
        });

        let outcome = self.gateway.toggle_enabled(step_id).await;
        self.settle(request, pending, outcome, |_, _| {
            let change = Change::new(kind, MutationKind::ToggleEnabled, step_id);
            match &before {
                Some(before) => change.with_relations(before),
                None => change,
            }
        })
    }

    fn require_persisted(&self, request: &MutationRequest) -> MutationResult<()> {
        if request.target_id() <= 0 {
            return Err(MutationFailure::new(
                request.clone(),
                CoordinatorError::context(
                    request.operation(),
                    "the target has not been created yet",
                ),
            ));
        }
        Ok(())
    }

    /// Steps 1-3: cancel, hold, snapshot and apply in one transaction
    fn begin(
        &self,
        kind: EntityKind,
        id: i64,
        footprint: Footprint,
        apply: impl FnOnce(&mut CacheState),
    ) -> Pending {
        let (snapshot, hold) = self.cache.transaction(|state| {
            let detail = CacheKey::detail(kind, id);
            let mut keys = vec![detail.clone()];
            keys.extend(state.keys_containing(kind, id));
            for related in &footprint.related {
                keys.extend(state.keys_containing(kind, *related));
            }
            keys.extend(footprint.keys);

            let canceled = state.cancel_where(|key| {
                *key == detail || key.list_kind() == Some(kind) || keys.contains(key)
            });
            if !canceled.is_empty() {
                tracing::debug!(
                    "Canceled {} in-flight reads for {} {}",
                    canceled.len(),
                    kind.singular(),
                    id
                );
            }

            let snapshot = state.snapshot(keys.iter());
            let hold = state.hold(kind, keys);
            apply(state);
            (snapshot, hold)
        });
        Pending {
            snapshot,
            hold: self.cache.adopt_hold(hold),
        }
    }

    /// Steps 5-7: reconcile or roll back in one transaction
    fn settle<T>(
        &self,
        request: MutationRequest,
        pending: Pending,
        outcome: GatewayResult<T>,
        on_success: impl FnOnce(&mut CacheState, &T) -> Change,
    ) -> MutationResult<T> {
        let kind = request.kind();
        let Pending { snapshot, hold } = pending;
        match outcome {
            Ok(value) => {
                self.cache.transaction(|state| {
                    state.release_hold(hold.id());
                    let change = on_success(state, &value);
                    let mut plan = self.propagator.plan(&change);
                    plan.invalidate.extend(
                        snapshot
                            .keys()
                            .filter(|key| key.list_kind().is_some())
                            .cloned()
                            .map(InvalidationTarget::Exact),
                    );
                    plan.invalidate.extend(settled_targets(kind, change.id));
                    let applied = plan.apply(state);
                    tracing::debug!(
                        "{} settled: {} entries removed, {} marked stale",
                        request,
                        applied.removed.len(),
                        applied.invalidated.len()
                    );
                });
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(
                    "{} failed, rolling back {} cache entries: {}",
                    request,
                    snapshot.len(),
                    error
                );
                let targets = settled_targets(kind, request.target_id());
                self.cache.transaction(|state| {
                    state.release_hold(hold.id());
                    state.restore(&snapshot);
                    state.invalidate_where(|key| {
                        targets.iter().any(|target| target.matches(key, None))
                    });
                });
                Err(MutationFailure::new(request, error))
            }
        }
    }

    /// Locate the moved entity and its siblings, then plan the new position
    ///
    /// Neighbors come from the cached scope list; any neighbor missing there
    /// is looked up in the cache, then fetched from the gateway.
    async fn plan_move(
        &self,
        kind: EntityKind,
        request: MoveRequest,
    ) -> Result<(Entity, MovePlan), CoordinatorError> {
        let moved = match self.cache.transaction(|state| state.find_entity(kind, request.id)) {
            Some(entity) => entity,
            None => self.gateway.get(kind, request.id).await?,
        };
        let scope = sibling_scope(&moved);
        let scope_key = CacheKey::filtered_list(kind, &scope);

        let mut siblings = match self.cache.get(&scope_key) {
            Some(CachedValue::List(items)) => items,
            _ => Vec::new(),
        };
        for neighbor in [request.prev_id, request.next_id].into_iter().flatten() {
            if neighbor == request.id || siblings.iter().any(|s| s.is(kind, neighbor)) {
                continue;
            }
            let found = match self.cache.transaction(|state| state.find_entity(kind, neighbor)) {
                Some(entity) => entity,
                None => self.gateway.get(kind, neighbor).await?,
            };
            if in_scope(&found, &scope) {
                siblings.push(found);
            }
        }

        let plan = self.engine.plan_move(&moved, &siblings, request)?;
        Ok((moved, plan))
    }
}

fn in_scope(entity: &Entity, scope: &FilterScope) -> bool {
    sibling_scope(entity) == *scope
}

/// The detail key and every general list of `kind`
fn settled_targets(kind: EntityKind, id: i64) -> Vec<InvalidationTarget> {
    vec![
        InvalidationTarget::Exact(CacheKey::detail(kind, id)),
        InvalidationTarget::Prefix(CacheKey::list(kind)),
    ]
}

/// Apply `f` to every cached copy of `(kind, id)` outside keys matching `skip`
fn patch_copies(
    state: &mut CacheState,
    kind: EntityKind,
    id: i64,
    skip: impl Fn(&CacheKey) -> bool,
    f: &mut dyn FnMut(&mut Entity),
) {
    for key in state.keys_containing(kind, id) {
        if !skip(&key) {
            state.update(&key, |value| value.update_entity(kind, id, &mut *f));
        }
    }
}

fn sort_by_position(value: &mut CachedValue) -> bool {
    let CachedValue::List(items) = value else {
        return false;
    };
    items.sort_by(|a, b| a.position().total_cmp(&b.position()));
    true
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod coordinator_test;
