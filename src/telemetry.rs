//! Logging setup for binaries embedding the core

use crate::{AtelierError, Result};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` does not say otherwise
pub const DEFAULT_DIRECTIVE: &str = "atelier=info";

/// Install a global fmt subscriber filtered by `RUST_LOG` plus `directive`.
///
/// Fails instead of panicking when a subscriber is already installed.
pub fn init_tracing(directive: &str) -> Result<()> {
    let directive = directive
        .parse::<Directive>()
        .map_err(|e| AtelierError::invalid_config("log directive", format!("{}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .try_init()
        .map_err(|e| AtelierError::invalid_config("tracing", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_directive() {
        let err = init_tracing("atelier=loud").unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }
}
