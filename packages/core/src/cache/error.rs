//! Query Error Types
//!
//! Errors surfaced to consumers reading through the cache.

use crate::cache::CacheKey;
use crate::gateway::GatewayError;
use thiserror::Error;

/// Errors raised by cached reads
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The gateway rejected the read (after any automatic retry)
    #[error("Read failed: {0}")]
    Remote(#[from] GatewayError),

    /// The read was superseded or canceled before it settled; nothing was written
    #[error("Read for {key} was canceled")]
    Cancelled { key: CacheKey },

    /// The cached value does not have the shape the caller asked for
    #[error("Cached value for {key} is not {expected}")]
    Decode { key: CacheKey, expected: &'static str },
}

impl QueryError {
    pub fn cancelled(key: &CacheKey) -> Self {
        Self::Cancelled { key: key.clone() }
    }

    pub fn decode(key: &CacheKey, expected: &'static str) -> Self {
        Self::Decode {
            key: key.clone(),
            expected,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
