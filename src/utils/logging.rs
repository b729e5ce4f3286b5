use tracing::Level;

/// Maps a level name (case-insensitive) to a tracing level.
///
/// Returns `None` for names that are not recognised.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_lowercase().as_str() {
        "error" | "critical" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize tracing for the process at `level`, falling back to INFO.
///
/// Uses `try_init`, so calling this more than once (tests, embedding) is harmless.
pub fn init(level: &str) {
    let resolved = parse_level(level).unwrap_or(Level::INFO);

    let installed = tracing_subscriber::fmt()
        .with_max_level(resolved)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed && parse_level(level).is_none() {
        tracing::warn!(requested = level, "unknown log level, using info");
    }
}
