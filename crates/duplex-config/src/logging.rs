//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. A `level` that is not
/// a plain level name is used as a filter directive. With `json` the
/// output is one JSON object per line, otherwise compact text on stderr.
/// Calling this twice is harmless; the second call is ignored.
///
/// ```ignore
/// init_logging("info", false);
/// tracing::info!("listening");
/// ```
pub fn init_logging(level: &str, json: bool) {
    let directive = parse_level(level).map_or_else(|| level.to_string(), |l| l.to_string());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };

    if result.is_ok() {
        tracing::debug!(level, json, "logging initialized");
    }
}

/// Parse a level name, ignoring case. `warning` is accepted for `warn`.
pub fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_names() {
        assert_eq!(parse_level("trace"), Some(tracing::Level::TRACE));
        assert_eq!(parse_level(" Debug "), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level("WARNING"), Some(tracing::Level::WARN));
        assert_eq!(parse_level("error"), Some(tracing::Level::ERROR));
    }

    #[test]
    fn test_parse_level_rejects_unknown() {
        assert_eq!(parse_level(""), None);
        assert_eq!(parse_level("verbose"), None);
        assert_eq!(parse_level("duplex_ipc=debug"), None);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging("debug", false);
        init_logging("info", true);
        tracing::info!("still alive");
    }
}
