use tunnelgate::config::{init_logging, LoggingConfig};

#[test]
fn test_init_logging_once() {
    let config = LoggingConfig {
        level: "debug".into(),
        format: "json".into(),
        ..LoggingConfig::default()
    };
    init_logging(&config).unwrap();
    tracing::info!(component = "test", "Logging initialized");

    // A second global subscriber is refused
    assert!(init_logging(&LoggingConfig::default()).is_err());
}
