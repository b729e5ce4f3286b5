use std::env;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::{PartialServerSettings, PartialSettings, Settings};
use super::{load_config, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "0.0.0.0");
    assert_eq!(settings.server.port, 1883);
    assert_eq!(settings.server.backlog, 5);
    assert_eq!(settings.broker.read_buffer_size, 1024);
    assert_eq!(settings.broker.outbound_queue_size, 256);
    assert_eq!(settings.broker.shutdown_timeout_ms, 1000);
    assert_eq!(settings.client.host, "127.0.0.1");
    assert_eq!(settings.client.keep_alive_secs, 30);
    assert_eq!(settings.client.ack_timeout_ms, 5000);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_partial_merge_keeps_defaults_for_missing_values() {
    let partial = PartialSettings {
        server: Some(PartialServerSettings {
            port: Some(2883),
            ..Default::default()
        }),
        ..Default::default()
    };

    let merged = partial.merge(Settings::default());
    assert_eq!(merged.server.port, 2883);
    assert_eq!(merged.server.host, "0.0.0.0");
    assert_eq!(merged.broker, Settings::default().broker);
}

#[test]
#[serial]
fn test_load_config_without_sources_is_default() {
    let tmp = TempDir::new().expect("create tempdir");
    let missing = tmp.path().join("absent");
    let cfg = load_config_from(missing.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg, Settings::default());
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    // load_config reads config/default.* relative to the working directory.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "127.0.0.1"
        port = 9000

        [broker]
        read_buffer_size = 4096
        outbound_queue_size = 16

        [client]
        keep_alive_secs = 5

        [logging]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.backlog, 5);
    assert_eq!(cfg.broker.read_buffer_size, 4096);
    assert_eq!(cfg.broker.outbound_queue_size, 16);
    assert_eq!(
        cfg.broker.limits(),
        crate::transport::Limits {
            read_buffer_size: 4096,
            queue_capacity: 16,
        }
    );
    assert_eq!(cfg.broker.shutdown_timeout_ms, 1000);
    assert_eq!(cfg.client.keep_alive_secs, 5);
    assert_eq!(cfg.logging.level, "debug");
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let missing = tmp.path().join("absent");

    temp_env::with_vars(
        [
            ("TIDEMQ__SERVER__PORT", Some("1999")),
            ("TIDEMQ__CLIENT__ACK_TIMEOUT_MS", Some("250")),
        ],
        || {
            let cfg = load_config_from(missing.to_str().unwrap()).expect("load_config failed");
            assert_eq!(cfg.server.port, 1999);
            assert_eq!(cfg.client.ack_timeout_ms, 250);
            assert_eq!(cfg.client.port, 1883);
        },
    );
}
