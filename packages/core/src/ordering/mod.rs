//! Ordered-Sibling Reorder Engine
//!
//! Computes positions for entities moved between two named neighbors of
//! their sibling scope. Positions are gap-based reals: appending adds one
//! gap past the last sibling, a move takes the midpoint of its neighbors,
//! and a scope whose gap is exhausted is renumbered to evenly spaced
//! multiples of the gap before the midpoint is recomputed.
//!
//! # Examples
//!
//! ```rust
//! use cmdshelf_core::ordering::ReorderEngine;
//!
//! let engine = ReorderEngine::default();
//! assert_eq!(engine.position_between(None, None), 1000.0);
//! assert_eq!(engine.position_between(Some(1.0), Some(2.0)), 1.5);
//! assert_eq!(engine.position_between(None, Some(500.0)), -500.0);
//! ```

use crate::cache::CacheKey;
use crate::config::{ConfigError, OrderingConfig};
use crate::models::{Entity, EntityKind, FilterScope, MoveRequest};
use thiserror::Error;

/// Why a move could not be planned
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderingError {
    #[error("{kind} {id} cannot be placed next to itself")]
    SelfReference { kind: EntityKind, id: i64 },

    #[error("{kind} {neighbor} is not a sibling of {kind} {id}")]
    NeighborNotInScope {
        kind: EntityKind,
        id: i64,
        neighbor: i64,
    },

    #[error("Neighbors {prev} and {next} are not in display order")]
    OutOfOrder { prev: i64, next: i64 },
}

/// New position for a moved entity, plus any sibling renumbering it required
#[derive(Debug, Clone, PartialEq)]
pub struct MovePlan {
    pub position: f64,
    /// `(id, position)` for every sibling that had to be renumbered
    pub renumbered: Vec<(i64, f64)>,
    /// Scope list keys that no longer reflect the authoritative order
    pub invalidate: Vec<CacheKey>,
}

/// Filter identifying the sibling scope an entity is ordered in
pub fn sibling_scope(entity: &Entity) -> FilterScope {
    match entity {
        Entity::Command(command) => FilterScope {
            parent_id: command.group_id,
            ..FilterScope::default()
        },
        Entity::Group(group) => FilterScope {
            parent_id: group.parent_group_id,
            ..FilterScope::default()
        },
        Entity::WorkflowStep(step) => FilterScope::workflow(step.workflow_id),
        Entity::Category(_) | Entity::Workflow(_) => FilterScope::root(),
    }
}

/// Calculates positions inside one sibling scope
#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderEngine {
    config: OrderingConfig,
}

impl ReorderEngine {
    pub fn new(config: OrderingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OrderingConfig {
        &self.config
    }

    /// Position strictly between two neighbors
    ///
    /// Either side may be absent: before the first sibling, after the last,
    /// or alone in an empty scope.
    pub fn position_between(&self, prev: Option<f64>, next: Option<f64>) -> f64 {
        let gap = self.config.gap;
        match (prev, next) {
            (None, None) => gap,
            (None, Some(next)) => next - gap,
            (Some(prev), None) => prev + gap,
            (Some(prev), Some(next)) => (prev + next) / 2.0,
        }
    }

    /// Position one gap past the last of `siblings`
    pub fn append_position(&self, siblings: impl IntoIterator<Item = f64>) -> f64 {
        let last = siblings.into_iter().fold(None, |max: Option<f64>, position| {
            Some(max.map_or(position, |max| max.max(position)))
        });
        self.position_between(last, None)
    }

    /// Whether the gap between two neighbors is too narrow for a midpoint
    pub fn needs_renumbering(&self, prev: Option<f64>, next: Option<f64>) -> bool {
        let (Some(prev), Some(next)) = (prev, next) else {
            return false;
        };
        let midpoint = self.position_between(Some(prev), Some(next));
        next - prev < self.config.min_gap || !(prev < midpoint && midpoint < next)
    }

    /// Evenly spaced positions `(i + 1) * gap` for ids in display order
    pub fn renumber(&self, ordered_ids: &[i64]) -> Vec<(i64, f64)> {
        ordered_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, (index + 1) as f64 * self.config.gap))
            .collect()
    }

    /// Plan moving `moved` between the siblings named in `request`
    ///
    /// `siblings` is the scope in display order; the moved entity itself is
    /// ignored if present. Neighbors must belong to the scope and appear in
    /// order.
    pub fn plan_move(
        &self,
        moved: &Entity,
        siblings: &[Entity],
        request: MoveRequest,
    ) -> Result<MovePlan, OrderingError> {
        let kind = moved.kind();
        let id = moved.id();

        if request.prev_id == Some(id) || request.next_id == Some(id) {
            return Err(OrderingError::SelfReference { kind, id });
        }

        let mut ordered: Vec<(i64, f64)> = siblings
            .iter()
            .filter(|sibling| sibling.kind() == kind && sibling.id() != id)
            .map(|sibling| (sibling.id(), sibling.position()))
            .collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut plan = MovePlan {
            position: 0.0,
            renumbered: Vec::new(),
            invalidate: vec![
                CacheKey::filtered_list(kind, &sibling_scope(moved)),
                CacheKey::list(kind),
            ],
        };

        let (mut prev, mut next) = self.neighbor_positions(kind, id, &ordered, request)?;
        if let (Some(p), Some(n), Some(prev_id), Some(next_id)) =
            (prev, next, request.prev_id, request.next_id)
        {
            if p >= n {
                return Err(OrderingError::OutOfOrder {
                    prev: prev_id,
                    next: next_id,
                });
            }
        }

        let candidate = self.position_between(prev, next);
        let collides = ordered.iter().any(|(_, position)| *position == candidate);
        if self.needs_renumbering(prev, next) || collides {
            tracing::info!(
                "Gap exhausted moving {} {}, renumbering {} siblings",
                kind.singular(),
                id,
                ordered.len()
            );
            let ids: Vec<i64> = ordered.iter().map(|(id, _)| *id).collect();
            plan.renumbered = self.renumber(&ids);
            ordered = plan.renumbered.clone();
            (prev, next) = self.neighbor_positions(kind, id, &ordered, request)?;
        }

        plan.position = self.position_between(prev, next);
        Ok(plan)
    }

    fn neighbor_positions(
        &self,
        kind: EntityKind,
        id: i64,
        ordered: &[(i64, f64)],
        request: MoveRequest,
    ) -> Result<(Option<f64>, Option<f64>), OrderingError> {
        let lookup = |neighbor: Option<i64>| -> Result<Option<f64>, OrderingError> {
            let Some(neighbor) = neighbor else {
                return Ok(None);
            };
            ordered
                .iter()
                .find(|(sibling, _)| *sibling == neighbor)
                .map(|(_, position)| Some(*position))
                .ok_or(OrderingError::NeighborNotInScope { kind, id, neighbor })
        };
        Ok((lookup(request.prev_id)?, lookup(request.next_id)?))
    }
}
