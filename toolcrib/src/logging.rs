//! Tracing bootstrap for binaries and test harnesses embedding toolcrib.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset: workflow events at info, every
/// sequence fallback always visible.
pub const DEFAULT_FILTER: &str = "info,toolcrib=info,toolcrib::sequence=warn";

/// Installs a global formatter honoring `RUST_LOG`.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
