//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing keys fall back to the defaults below.

use crate::domain::frame::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::domain::types::{DeviceKey, LotId};
use anyhow::{ensure, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

/// How the registry generates new device keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Draw from the 31-bit space and trust it not to collide
    Random,
    /// Redraw while the key is already registered
    CollisionChecked,
}

/// Background model used by the frame-difference detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundKind {
    /// First frame is the reference for the whole session
    Fixed,
    /// Exponential moving average of all frames seen
    RunningAverage,
}

/// Image axis along which vehicle travel is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Direction of travel along the axis that counts as entering the lot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Inbound {
    Positive,
    Negative,
}

/// What the sensor writes to its display device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Camera frame passed through untouched
    Color,
    /// Binary motion mask
    Mask,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Site label attached to exported metrics
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "central".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub key_policy: KeyPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            key_policy: KeyPolicy::CollisionChecked,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Base URL of the aggregator
    pub server_url: String,
    /// Lot to register against (omit to register unassigned)
    pub lot: Option<LotId>,
    /// Reuse an existing device key instead of registering
    pub device_key: Option<u32>,
    pub request_timeout_ms: u64,
    pub display_mode: DisplayMode,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            lot: None,
            device_key: None,
            request_timeout_ms: 2000,
            display_mode: DisplayMode::Color,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, initial_backoff_ms: 200, max_backoff_ms: 5000, multiplier: 2.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Per-pixel difference above which a pixel counts as motion (0-255)
    pub threshold: u8,
    /// 3x3 dilation passes applied to the thresholded mask
    pub dilate_iterations: u32,
    pub background: BackgroundKind,
    /// Blend factor for the running-average background
    pub alpha: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { threshold: 25, dilate_iterations: 2, background: BackgroundKind::Fixed, alpha: 0.05 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Mask area (pixels) at which a motion episode starts
    pub activate_area: usize,
    /// Mask area (pixels) at or below which an active episode ends
    pub release_area: usize,
    pub axis: Axis,
    pub inbound: Inbound,
    /// Minimum centroid travel (pixels) for an episode to count
    pub min_travel: f64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            activate_area: 4000,
            release_area: 1500,
            axis: Axis::Horizontal,
            inbound: Inbound::Positive,
            min_travel: 80.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Raw BGR24 frame source; "-" reads stdin
    pub source: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { source: "-".to_string(), width: DEFAULT_WIDTH, height: DEFAULT_HEIGHT }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DisplayConfig {
    /// Raw frame sink path; no display when unset
    pub sink: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub server: ServerConfig,
    pub sensor: SensorConfig,
    pub retry: RetryConfig,
    pub detector: DetectorConfig,
    pub events: EventsConfig,
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    site_id: String,
    bind_address: String,
    port: u16,
    key_policy: KeyPolicy,
    server_url: String,
    sensor_lot: Option<LotId>,
    sensor_device_key: Option<DeviceKey>,
    request_timeout_ms: u64,
    display_mode: DisplayMode,
    retry_max_attempts: u32,
    retry_initial_backoff_ms: u64,
    retry_max_backoff_ms: u64,
    retry_multiplier: f64,
    detector_threshold: u8,
    detector_dilate_iterations: u32,
    detector_background: BackgroundKind,
    detector_alpha: f32,
    events: EventsConfig,
    capture_source: String,
    capture_width: u32,
    capture_height: u32,
    display_sink: Option<String>,
    metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults are known-valid, so conversion cannot fail
        Self::from_toml(TomlConfig::default(), "default")
            .unwrap_or_else(|_| unreachable!("default configuration is valid"))
    }
}

impl Config {
    /// Config path: the `--config` value if given, then `CONFIG_FILE`, then the dev default
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, &path.display().to_string())
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn from_toml(toml_config: TomlConfig, config_file: &str) -> anyhow::Result<Self> {
        let TomlConfig { site, server, sensor, retry, detector, events, capture, display, metrics } =
            toml_config;

        ensure!(
            events.release_area < events.activate_area,
            "events.release_area ({}) must be below events.activate_area ({})",
            events.release_area,
            events.activate_area
        );
        ensure!(
            detector.alpha > 0.0 && detector.alpha <= 1.0,
            "detector.alpha must be in (0, 1], got {}",
            detector.alpha
        );
        ensure!(retry.max_attempts >= 1, "retry.max_attempts must be at least 1");
        ensure!(retry.multiplier >= 1.0, "retry.multiplier must be at least 1.0");
        ensure!(capture.width > 0 && capture.height > 0, "capture dimensions must be non-zero");
        ensure!(metrics.interval_secs > 0, "metrics.interval_secs must be non-zero");

        let sensor_device_key = match sensor.device_key {
            Some(raw) => Some(
                DeviceKey::new(raw)
                    .with_context(|| format!("sensor.device_key {raw} exceeds 31 bits"))?,
            ),
            None => None,
        };

        Ok(Self {
            config_file: config_file.to_string(),
            site_id: site.id,
            bind_address: server.bind_address,
            port: server.port,
            key_policy: server.key_policy,
            server_url: sensor.server_url.trim_end_matches('/').to_string(),
            sensor_lot: sensor.lot,
            sensor_device_key,
            request_timeout_ms: sensor.request_timeout_ms,
            display_mode: sensor.display_mode,
            retry_max_attempts: retry.max_attempts,
            retry_initial_backoff_ms: retry.initial_backoff_ms,
            retry_max_backoff_ms: retry.max_backoff_ms,
            retry_multiplier: retry.multiplier,
            detector_threshold: detector.threshold,
            detector_dilate_iterations: detector.dilate_iterations,
            detector_background: detector.background,
            detector_alpha: detector.alpha,
            events,
            capture_source: capture.source,
            capture_width: capture.width,
            capture_height: capture.height,
            display_sink: display.sink,
            metrics_interval_secs: metrics.interval_secs,
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Resolve the path from the command line and environment, then load it
    pub fn load(cli: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli))
    }

    // Getters for all config fields
    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key_policy(&self) -> KeyPolicy {
        self.key_policy
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn sensor_lot(&self) -> Option<&LotId> {
        self.sensor_lot.as_ref()
    }

    pub fn sensor_device_key(&self) -> Option<DeviceKey> {
        self.sensor_device_key
    }

    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn retry_max_attempts(&self) -> u32 {
        self.retry_max_attempts
    }

    pub fn retry_initial_backoff_ms(&self) -> u64 {
        self.retry_initial_backoff_ms
    }

    pub fn retry_max_backoff_ms(&self) -> u64 {
        self.retry_max_backoff_ms
    }

    pub fn retry_multiplier(&self) -> f64 {
        self.retry_multiplier
    }

    pub fn detector_threshold(&self) -> u8 {
        self.detector_threshold
    }

    pub fn detector_dilate_iterations(&self) -> u32 {
        self.detector_dilate_iterations
    }

    pub fn detector_background(&self) -> BackgroundKind {
        self.detector_background
    }

    pub fn detector_alpha(&self) -> f32 {
        self.detector_alpha
    }

    pub fn events(&self) -> &EventsConfig {
        &self.events
    }

    pub fn capture_source(&self) -> &str {
        &self.capture_source
    }

    pub fn capture_width(&self) -> u32 {
        self.capture_width
    }

    pub fn capture_height(&self) -> u32 {
        self.capture_height
    }

    pub fn display_sink(&self) -> Option<&str> {
        self.display_sink.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    /// Builder method for tests to point the sensor at a server
    pub fn with_server_url(mut self, url: &str) -> Self {
        self.server_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Builder method for tests to shorten retry delays
    pub fn with_retry(mut self, max_attempts: u32, initial_backoff_ms: u64) -> Self {
        self.retry_max_attempts = max_attempts.max(1);
        self.retry_initial_backoff_ms = initial_backoff_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.key_policy(), KeyPolicy::CollisionChecked);
        assert_eq!(config.detector_threshold(), 25);
        assert_eq!(config.detector_dilate_iterations(), 2);
        assert_eq!(config.detector_background(), BackgroundKind::Fixed);
        assert_eq!(config.capture_width(), 640);
        assert_eq!(config.capture_height(), 480);
        assert_eq!(config.display_mode(), DisplayMode::Color);
        assert!(config.sensor_lot().is_none());
        assert!(config.display_sink().is_none());
    }

    #[test]
    fn test_resolve_config_path_default() {
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_prefers_command_line() {
        assert_eq!(Config::resolve_config_path(Some("config/lot-a.toml")), "config/lot-a.toml");
    }

    #[test]
    fn test_rejects_inverted_event_thresholds() {
        let mut toml_config = TomlConfig::default();
        toml_config.events.activate_area = 100;
        toml_config.events.release_area = 100;
        assert!(Config::from_toml(toml_config, "test").is_err());
    }

    #[test]
    fn test_rejects_out_of_range_device_key() {
        let mut toml_config = TomlConfig::default();
        toml_config.sensor.device_key = Some(u32::MAX);
        assert!(Config::from_toml(toml_config, "test").is_err());
    }

    #[test]
    fn test_server_url_trailing_slash_trimmed() {
        let config = Config::default().with_server_url("http://host:1234/");
        assert_eq!(config.server_url(), "http://host:1234");
    }
}
