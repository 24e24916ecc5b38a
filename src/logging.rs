//! Structured logging setup.
//!
//! Filtering follows the `CRT_LOG` environment variable (`EnvFilter`
//! syntax, e.g. `connector_runtime::executor=debug,info`), defaulting to
//! `info`. Logs go to stderr so command output on stdout stays clean.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `json` switches to one JSON object per
/// line. A second call is a no-op.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_env("CRT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
