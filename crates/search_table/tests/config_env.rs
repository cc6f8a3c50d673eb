//! Environment-driven connector configuration.

use std::time::Duration;

use anyhow::Result;
use search_table::config::{DEFAULT_MAX_REFILLS_PER_POLL, DEFAULT_PAGE_SIZE};
use search_table::ConnectorConfig;
use serial_test::serial;

const VARS: [&str; 4] = [
    "SEARCH_TABLE_PAGE_SIZE",
    "SEARCH_TABLE_REQUEST_TIMEOUT_MS",
    "SEARCH_TABLE_MAX_REFILLS_PER_POLL",
    "SEARCH_TABLE_DEFAULT_ENDPOINT",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn defaults_apply_without_environment() -> Result<()> {
    clear_env();
    let config = ConnectorConfig::from_env()?;
    assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    assert_eq!(config.max_refills_per_poll, DEFAULT_MAX_REFILLS_PER_POLL);
    assert_eq!(config.default_endpoint, None);
    assert_eq!(config, ConnectorConfig::default());
    Ok(())
}

#[test]
#[serial]
fn environment_overrides_are_read_and_clamped() -> Result<()> {
    clear_env();
    std::env::set_var("SEARCH_TABLE_PAGE_SIZE", "0");
    std::env::set_var("SEARCH_TABLE_REQUEST_TIMEOUT_MS", "2500");
    std::env::set_var("SEARCH_TABLE_MAX_REFILLS_PER_POLL", "8");
    std::env::set_var("SEARCH_TABLE_DEFAULT_ENDPOINT", "  search-2:8983  ");

    let config = ConnectorConfig::from_env()?;
    clear_env();

    assert_eq!(config.page_size, 1);
    assert_eq!(config.request_timeout, Duration::from_millis(2500));
    assert_eq!(config.max_refills_per_poll, 8);
    assert_eq!(config.default_endpoint.as_deref(), Some("search-2:8983"));
    Ok(())
}

#[test]
#[serial]
fn malformed_numbers_are_rejected() {
    clear_env();
    std::env::set_var("SEARCH_TABLE_PAGE_SIZE", "lots");
    let result = ConnectorConfig::from_env();
    clear_env();
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("lots"));
}
