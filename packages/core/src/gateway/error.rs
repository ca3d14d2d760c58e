//! Gateway Error Types
//!
//! The remote authority reports failures as a structured `{code, message}`
//! pair. The code decides how the cache reacts: transient failures may be
//! retried (reads only), scope violations never are.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NOT_FOUND: &str = "NOT_FOUND";
pub const INVALID_DATA: &str = "INVALID_DATA";
pub const CIRCULAR_REFERENCE: &str = "CIRCULAR_REFERENCE";
pub const FOREIGN_KEY_VIOLATION: &str = "FOREIGN_KEY_VIOLATION";
pub const DATABASE_LOCKED: &str = "DATABASE_LOCKED";
pub const DATABASE_CONNECTION_FAIL: &str = "DATABASE_CONNECTION_FAIL";
pub const INTERNAL: &str = "INTERNAL";
pub const TIMEOUT: &str = "TIMEOUT";
pub const NETWORK: &str = "NETWORK";
pub const DECODE: &str = "DECODE";

const TRANSIENT_CODES: [&str; 5] = [
    DATABASE_LOCKED,
    DATABASE_CONNECTION_FAIL,
    INTERNAL,
    TIMEOUT,
    NETWORK,
];

const SCOPE_VIOLATION_CODES: [&str; 4] = [
    NOT_FOUND,
    INVALID_DATA,
    CIRCULAR_REFERENCE,
    FOREIGN_KEY_VIOLATION,
];

/// Structured failure returned by the remote entity gateway
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: String,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl std::fmt::Display, id: i64) -> Self {
        Self::new(NOT_FOUND, format!("{} with ID {} not found", entity, id))
    }

    pub fn invalid_data(field: &str, reason: impl Into<String>) -> Self {
        Self::new(INVALID_DATA, format!("Invalid {}: {}", field, reason.into()))
    }

    pub fn circular_reference(group_id: i64, parent_id: i64) -> Self {
        Self::new(
            CIRCULAR_REFERENCE,
            format!(
                "Circular reference detected: group {} cannot have parent {} (would create loop)",
                group_id, parent_id
            ),
        )
    }

    pub fn foreign_key(field: &str, referenced_id: i64) -> Self {
        Self::new(
            FOREIGN_KEY_VIOLATION,
            format!("{} references non-existent ID {}", field, referenced_id),
        )
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DECODE, message)
    }

    /// Network or backend hiccup that a read may retry
    pub fn is_transient(&self) -> bool {
        TRANSIENT_CODES.contains(&self.code.as_str())
    }

    /// The request referred to a nonexistent neighbor, parent or reference
    pub fn is_scope_violation(&self) -> bool {
        SCOPE_VIOLATION_CODES.contains(&self.code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(GatewayError::new(DATABASE_LOCKED, "busy").is_transient());
        assert!(!GatewayError::not_found("commands", 3).is_transient());
        assert!(GatewayError::not_found("commands", 3).is_scope_violation());
        assert!(!GatewayError::new("SOMETHING_ELSE", "x").is_transient());
    }

    #[test]
    fn test_wire_shape() {
        let err = GatewayError::foreign_key("category_id", 9);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "FOREIGN_KEY_VIOLATION");
        assert_eq!(value["message"], "category_id references non-existent ID 9");
        assert_eq!(
            err.to_string(),
            "FOREIGN_KEY_VIOLATION: category_id references non-existent ID 9"
        );
    }
}
