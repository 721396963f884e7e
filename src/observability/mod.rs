use tracing_subscriber::EnvFilter;

/// Map a configured log level onto a tracing filter directive.
///
/// - "DISABLED" -> `None` (no subscriber installed)
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Initialize the tracing subscriber with the configured log level.
pub fn init_tracing(log_level: &str) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };

    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
