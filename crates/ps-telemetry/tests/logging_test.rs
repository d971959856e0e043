use ps_telemetry::logging::{self, LogFormat};

#[test]
fn init_logging_is_repeatable() {
    // Second call is a safe no-op.
    logging::init_logging("periscope-test", "debug");
    logging::init_logging("periscope-test", "info");

    tracing::info!(client_id = "App#iOS#iPhone#D1", "human-readable log line");
}

#[test]
fn init_json_after_human_is_noop() {
    logging::init("periscope-test-json", "info", LogFormat::Json);
    tracing::info!(key = "value", "json log line");
}

#[test]
fn format_from_flag() {
    assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
    assert_eq!(LogFormat::from_json_flag(false), LogFormat::Human);
    assert_eq!(LogFormat::default(), LogFormat::Human);
}
