//! Diagnostic logging for the harness itself
//!
//! The library only emits `tracing` events (launch, stdin closed, prompt
//! answered, kill, termination, failed expectation). Nothing is printed unless
//! a subscriber is installed; [`init`] installs the one the CLI uses.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn";

/// Install a stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Calling it again, or after another subscriber was installed, is a no-op.
///
/// # Example
/// ```bash
/// RUST_LOG=emx_proctest=debug emx-proctest --fork tests/fixtures/prompt.sh
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init();
        init();
        tracing::debug!("still alive");
    }
}
