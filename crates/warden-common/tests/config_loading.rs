//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "tests"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the controller runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use warden_common::config::{AppConfig, RemediationBackend};
use warden_common::logging::LogFormat;

const FULL: &str = r#"
[identity]
leader_name = "controller-a"

[election]
name = "warden-leader"
term = 30

[database]
url = "sqlite:///tmp/warden-test.db?mode=rwc"
max_connections = 2

[monitors.management]
type = "serf"
address = "127.0.0.1:7373"

[monitors.storage]
address = "127.0.0.1:7374"

[monitors.network]
address = "127.0.0.1:7375"

[policy]
drain_interval = 6
fence_on_management_only = true

[fence]
disable_fence_ops = true

[remediation]
backend = "converge"

[remediation.converge]
url = "http://converge.internal:8080"
username = "ops"

[logging]
format = "pretty"

[metrics]
enabled = true
listen = "127.0.0.1:9878"
"#;

#[test]
fn loads_first_existing_candidate() {
    std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("warden.toml");
    fs::write(&present, FULL).unwrap();

    let loaded = AppConfig::load_with_source(&[&missing, &present]).unwrap();
    assert_eq!(loaded.source, present);
    let config = loaded.config;
    assert_eq!(config.leader_name().unwrap(), "controller-a");
    let tags: Vec<_> = config.monitors.keys().map(String::as_str).collect();
    assert_eq!(tags, vec!["management", "storage", "network"]);
    assert!(config.policy.fence_on_management_only);
    assert!(config.fence.disable_fence_ops);
    assert!(!config.fence.evacuate_on_fence_failure);
    assert_eq!(config.remediation.backend, RemediationBackend::Converge);
    assert_eq!(config.remediation.converge.username, "ops");
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert!(config.metrics.enabled);
    assert_eq!(config.election.effective_refresh_interval(), Duration::from_secs(6));
    assert_eq!(config.database.max_connections, 2);
}

#[test]
fn reports_every_inspected_candidate() {
    std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.toml");
    let second = dir.path().join("b.toml");
    let err = AppConfig::load(&[&first, &second]).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("a.toml"));
    assert!(message.contains("b.toml"));
}

#[test]
fn invalid_file_names_the_path() {
    std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[monitors.network]\naddress = 7373\n").unwrap();
    let err = AppConfig::load(&[&path]).unwrap_err();
    assert!(format!("{:#}", err).contains("broken.toml"));
}

#[test]
fn shipped_example_config_is_valid() {
    let config: AppConfig = include_str!("../../../configs/warden.toml").parse().unwrap();
    assert_eq!(config.monitors.len(), 3);
    assert_eq!(config.remediation.backend, RemediationBackend::Openstack);
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert!(!config.policy.fence_on_management_only);
    assert!(config.database.url.starts_with("postgres://"));
}

#[test]
fn hostname_monitor_address_fails_at_load() {
    std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.toml");
    fs::write(&path, FULL.replace("127.0.0.1:7375", "localhost:7375")).unwrap();
    let err = AppConfig::load(&[&path]).unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("monitor 'network' is misconfigured"));
    assert!(message.contains("'localhost:7375' is not ip:port"));
}
