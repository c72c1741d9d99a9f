//! Global subscriber installation and runtime filter reload
//!
//! One test per binary: the subscriber is process-global.

use custodian_log::{Config, Format, LogError, LoggerBuilder, WriterConfig};

#[test]
fn test_reloadable_logger_changes_filter_at_runtime() {
    // GIVEN: A reloadable logger writing through the test harness
    let config = Config {
        level: "info".to_string(),
        format: Format::Json,
        writer: WriterConfig::Test,
        reloadable: true,
        ..Config::default()
    };
    let guard = LoggerBuilder::from_config(config).build().unwrap();
    let handle = guard.reload_handle().expect("reloadable logger has a handle");
    assert_eq!(handle.current_filter(), "info");

    // WHEN: The filter is narrowed to the broker at debug
    handle.reload("warn,custodian_broker=debug").unwrap();

    // THEN: The new directive is current
    assert_eq!(handle.current_filter(), "warn,custodian_broker=debug");
    tracing::debug!(target: "custodian_broker", "visible after reload");

    // WHEN: A malformed directive is supplied
    let err = handle.reload("custodian_broker=loud").unwrap_err();

    // THEN: It is rejected and the previous filter stays
    assert!(matches!(err, LogError::Filter { .. }));
    assert_eq!(handle.current_filter(), "warn,custodian_broker=debug");

    // WHEN: Only the rotation module is turned up
    handle
        .set_target_level("custodian_broker::rotation", "trace")
        .unwrap();

    // THEN: The other directives are kept
    assert_eq!(
        handle.current_filter(),
        "warn,custodian_broker=debug,custodian_broker::rotation=trace"
    );

    // WHEN: A second subscriber is installed
    let second = custodian_log::init_with(Config::test());

    // THEN: It is refused
    assert!(matches!(second, Err(LogError::AlreadyInstalled(_))));
}
