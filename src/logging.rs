//! Diagnostic tracing for the CLI.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate
//! from the structured task and feedback logs under `.pipewright/`, which are
//! always written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "pipewright=debug" } else { "pipewright=info" }
}

/// Install the global subscriber: compact text or one JSON object per line.
///
/// Calling it twice is harmless; the second call leaves the first subscriber
/// in place.
pub fn init(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_level() {
        assert_eq!(default_directive(false), "pipewright=info");
        assert_eq!(default_directive(true), "pipewright=debug");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(false, false);
        init(true, true);
    }
}
