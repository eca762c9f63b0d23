//! Log output for the CLI.
//!
//! The engine logs through the `log` facade; the fmt subscriber installed
//! here bridges those records and writes them to stderr so stdout stays
//! clean for `--json`.

use tracing_subscriber::EnvFilter;

/// Level used when neither `RUST_LOG` nor `LOG_LEVEL` is set.
const DEFAULT_LEVEL: &str = "info";

/// Map a `LOG_LEVEL` value to a filter directive. Python-style names
/// (`WARNING`, `CRITICAL`) would otherwise parse as target names.
fn level_directive(value: &str) -> Option<String> {
    let level = value.trim().to_ascii_lowercase();
    match level.as_str() {
        "" => None,
        "warning" => Some("warn".to_string()),
        "critical" | "fatal" => Some("error".to_string()),
        _ => Some(level),
    }
}

fn filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| level_directive(&v))
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
