//! Tracing setup for binaries and tests embedding the core
//!
//! The core only emits `tracing` events; installing a subscriber is left to
//! the host. `RUST_LOG` overrides the default filter, e.g.
//! `RUST_LOG=cmdshelf_core=debug` to follow cache reads and rollbacks.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to `info`
///
/// Returns `false` when a global subscriber is already installed.
pub fn init_tracing() -> bool {
    init_tracing_with(DEFAULT_FILTER)
}

/// Like [`init_tracing`], with an explicit fallback filter
pub fn init_tracing_with(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_refused() {
        init_tracing_with("debug");
        assert!(!init_tracing());
    }
}
