//! Integration tests for configuration loading

use lot_occupancy::domain::types::{DeviceKey, LotId};
use lot_occupancy::infra::config::{Axis, BackgroundKind, Inbound};
use lot_occupancy::infra::{Config, DisplayMode, KeyPolicy};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "test-site"

[server]
bind_address = "127.0.0.1"
port = 9090
key_policy = "random"

[sensor]
server_url = "http://lots.local:9090"
lot = 7
device_key = 424242
display_mode = "mask"

[retry]
max_attempts = 3
initial_backoff_ms = 50

[detector]
threshold = 30
background = "running_average"
alpha = 0.1

[events]
activate_area = 500
release_area = 100
axis = "vertical"
inbound = "negative"

[capture]
source = "/tmp/frames.raw"
width = 320
height = 240

[display]
sink = "/tmp/out.raw"

[metrics]
interval_secs = 15
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.port(), 9090);
    assert_eq!(config.key_policy(), KeyPolicy::Random);
    assert_eq!(config.server_url(), "http://lots.local:9090");
    assert_eq!(config.sensor_lot(), Some(&LotId::new("7")));
    assert_eq!(config.sensor_device_key(), Some(DeviceKey(424242)));
    assert_eq!(config.display_mode(), DisplayMode::Mask);
    assert_eq!(config.retry_max_attempts(), 3);
    assert_eq!(config.retry_initial_backoff_ms(), 50);
    assert_eq!(config.detector_threshold(), 30);
    assert_eq!(config.detector_dilate_iterations(), 2);
    assert_eq!(config.detector_background(), BackgroundKind::RunningAverage);
    assert_eq!(config.events().axis, Axis::Vertical);
    assert_eq!(config.events().inbound, Inbound::Negative);
    assert_eq!(config.capture_source(), "/tmp/frames.raw");
    assert_eq!(config.capture_width(), 320);
    assert_eq!(config.display_sink(), Some("/tmp/out.raw"));
    assert_eq!(config.metrics_interval_secs(), 15);
}

#[test]
fn test_inverted_hysteresis_is_rejected() {
    let temp_file = write_config(
        r#"
[events]
activate_area = 100
release_area = 200
"#,
    );
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_out_of_range_device_key_is_rejected() {
    let temp_file = write_config(
        r#"
[sensor]
device_key = 4000000000
"#,
    );
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.port(), 8080);
    assert_eq!(config.key_policy(), KeyPolicy::CollisionChecked);
    assert_eq!(config.detector_threshold(), 25);
    assert_eq!(config.capture_width(), 640);
}

#[test]
fn test_shipped_dev_config_loads() {
    let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml")).unwrap();
    assert_eq!(config.sensor_lot(), Some(&LotId::new("A")));
    assert_eq!(config.sensor_device_key(), None);
}
