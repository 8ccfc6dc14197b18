//! Tests for logging configuration
//!
//! Only one global subscriber can exist per process, so installation is
//! checked in a single test.

use device_pubsub::observability::logging::{
    filter_directives, init_logging, parse_level, LogFormat,
};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    for input in ["json", "JSON", "Json"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json);
    }
    for input in ["pretty", "PRETTY", "Pretty"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Pretty);
    }
    for input in ["compact", "COMPACT", "Compact"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Compact);
    }
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Unknown formats default to JSON for production safety
    for input in ["invalid", "", "xml", "yaml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_transport_dependencies_are_quieted() {
    let directives = filter_directives(Level::TRACE);
    for dependency in ["rumqttc", "hyper", "reqwest"] {
        assert!(
            directives.contains(&format!("{dependency}=warn")),
            "{dependency} should be capped at warn: {directives}"
        );
    }
}

#[test]
fn test_init_logging_installs_once() {
    assert!(init_logging(Level::DEBUG, LogFormat::Compact, true));
    assert!(
        !init_logging(Level::INFO, LogFormat::Json, false),
        "Second installation is refused without panicking"
    );
    tracing::info!(principal = "sensor-9", "logging initialized");
}
