//! Service Layer Error Types
//!
//! Mutation failures carry the request that failed and tell apart the two
//! ways a mutation can fail: the remote authority rejected it, or the cache
//! could not find the context the mutation needed (a neighbor outside the
//! cached scope, a patch for the wrong kind, a draft id).

use crate::gateway::GatewayError;
use crate::models::{Entity, EntityKind, EntityPatch, MoveRequest};
use crate::ordering::OrderingError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The mutation a consumer asked for, echoed back on failure
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum MutationRequest {
    Create {
        entity: Entity,
    },
    Update {
        kind: EntityKind,
        id: i64,
        patch: EntityPatch,
    },
    Delete {
        kind: EntityKind,
        id: i64,
    },
    Move {
        kind: EntityKind,
        request: MoveRequest,
    },
    ToggleFavorite {
        kind: EntityKind,
        id: i64,
    },
    ToggleEnabled {
        id: i64,
    },
}

impl MutationRequest {
    pub fn kind(&self) -> EntityKind {
        match self {
            MutationRequest::Create { entity } => entity.kind(),
            MutationRequest::Update { kind, .. }
            | MutationRequest::Delete { kind, .. }
            | MutationRequest::Move { kind, .. }
            | MutationRequest::ToggleFavorite { kind, .. } => *kind,
            MutationRequest::ToggleEnabled { .. } => EntityKind::WorkflowStep,
        }
    }

    /// Id of the targeted entity; 0 for a create
    pub fn target_id(&self) -> i64 {
        match self {
            MutationRequest::Create { entity } => entity.id(),
            MutationRequest::Move { request, .. } => request.id,
            MutationRequest::Update { id, .. }
            | MutationRequest::Delete { id, .. }
            | MutationRequest::ToggleFavorite { id, .. }
            | MutationRequest::ToggleEnabled { id } => *id,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            MutationRequest::Create { .. } => "create",
            MutationRequest::Update { .. } => "update",
            MutationRequest::Delete { .. } => "delete",
            MutationRequest::Move { .. } => "move",
            MutationRequest::ToggleFavorite { .. } => "toggle favorite",
            MutationRequest::ToggleEnabled { .. } => "toggle enabled",
        }
    }
}

impl fmt::Display for MutationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationRequest::Create { entity } => {
                write!(f, "create {} {:?}", entity.kind().singular(), entity.name())
            }
            other => write!(
                f,
                "{} {} {}",
                other.operation(),
                other.kind().singular(),
                other.target_id()
            ),
        }
    }
}

/// Why a mutation failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    /// The remote authority rejected the call; carries its `{code, message}`
    #[error("Remote rejected the mutation: {0}")]
    Remote(#[from] GatewayError),

    /// The cache could not locate the context the mutation needed
    #[error("Cannot {operation}: {reason}")]
    Context {
        operation: &'static str,
        reason: String,
    },
}

impl CoordinatorError {
    pub fn context(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Context {
            operation,
            reason: reason.into(),
        }
    }

    /// The gateway error, when the authority rejected the mutation
    pub fn remote(&self) -> Option<&GatewayError> {
        match self {
            Self::Remote(error) => Some(error),
            Self::Context { .. } => None,
        }
    }

    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context { .. })
    }
}

impl From<OrderingError> for CoordinatorError {
    fn from(error: OrderingError) -> Self {
        Self::context("move", error.to_string())
    }
}

/// A failed mutation, with the request that caused it
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{request} failed: {error}")]
pub struct MutationFailure {
    pub request: MutationRequest,
    #[source]
    pub error: CoordinatorError,
}

impl MutationFailure {
    pub fn new(request: MutationRequest, error: impl Into<CoordinatorError>) -> Self {
        Self {
            request,
            error: error.into(),
        }
    }

    /// Message suitable for showing to the user
    pub fn message(&self) -> String {
        match &self.error {
            CoordinatorError::Remote(remote) => remote.message.clone(),
            CoordinatorError::Context { reason, .. } => reason.clone(),
        }
    }
}

pub type MutationResult<T> = Result<T, MutationFailure>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::error::NOT_FOUND;

    #[test]
    fn test_failure_keeps_request_and_remote_code() {
        let request = MutationRequest::Delete {
            kind: EntityKind::Command,
            id: 7,
        };
        let failure = MutationFailure::new(request.clone(), GatewayError::not_found("command", 7));

        assert_eq!(failure.request, request);
        assert_eq!(failure.error.remote().map(|e| e.code.as_str()), Some(NOT_FOUND));
        assert_eq!(failure.message(), "command with ID 7 not found");
        assert!(failure.to_string().starts_with("delete command 7 failed"));
    }

    #[test]
    fn test_ordering_errors_are_context_errors() {
        let error = CoordinatorError::from(OrderingError::OutOfOrder { prev: 2, next: 1 });
        assert!(error.is_context());
        assert!(error.remote().is_none());
    }
}
