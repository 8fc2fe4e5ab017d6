//! Tracing setup for the `storyforge` binary.
//!
//! Reads `RUST_LOG`; defaults to `warn`, or `storyforge=debug` with `--verbose`.
//! Output goes to stderr so stdout stays free for command output.
//!
//! ```bash
//! RUST_LOG=storyforge::scheduler=debug storyforge run session.json analysis
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "warn,storyforge=debug" } else { "warn" }
}

/// Install the global subscriber: compact text, or one JSON object per line.
///
/// Calling it twice is harmless; the second call keeps the first subscriber.
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
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "warn");
        assert!(default_directive(true).contains("storyforge=debug"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(false, false);
        init(true, true);
    }
}
