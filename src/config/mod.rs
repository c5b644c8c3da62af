//! Configuration management
//!
//! Layered, lowest precedence first: serde defaults, optional config file,
//! `DIALSERVER_*` environment variables, command-line overrides.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregator::AggregatorSettings;
use crate::device::{
    DeviceSetup, MonitorSettings, RetryConfig, SURFACE_DIAL_INPUT_NAME, SURFACE_DIAL_PRODUCT_ID,
    SURFACE_DIAL_VENDOR_ID,
};

const ENV_PREFIX: &str = "DIALSERVER";
const APP_DIR_NAME: &str = "dialserver";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("dial_steps must be non-zero")]
    ZeroDialSteps,

    #[error("min_degrees must be non-negative (got {0})")]
    NegativeMinDegrees(f64),

    #[error("keepalive_ms must be non-zero")]
    ZeroKeepalive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Consumer WebSocket port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Debug page port, 0 disables the page
    #[serde(default = "default_html_port")]
    pub html_port: u16,

    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    #[serde(default = "default_aggregation_ms")]
    pub aggregation_ms: u64,

    #[serde(default = "default_min_degrees")]
    pub min_degrees: f64,

    #[serde(default = "default_dial_steps")]
    pub dial_steps: u16,

    #[serde(default = "default_button_suppression_ms")]
    pub button_suppression_ms: u64,

    #[serde(default)]
    pub suppress_while_held: bool,

    #[serde(default)]
    pub buzz: bool,

    #[serde(default = "default_buzz_repeat_count")]
    pub buzz_repeat_count: u8,

    #[serde(default = "default_true")]
    pub haptics: bool,

    #[serde(default = "default_true")]
    pub send_features: bool,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// A connected session shorter than this still counts as a failed attempt
    #[serde(default = "default_stable_session_ms")]
    pub stable_session_ms: u64,

    #[serde(default = "default_discovery_poll_ms")]
    pub discovery_poll_ms: u64,

    #[serde(default = "default_consumer_queue")]
    pub consumer_queue: usize,

    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_ws_port() -> u16 {
    3000
}

fn default_html_port() -> u16 {
    3080
}

fn default_keepalive_ms() -> u64 {
    30_000
}

fn default_aggregation_ms() -> u64 {
    50
}

fn default_min_degrees() -> f64 {
    0.5
}

fn default_dial_steps() -> u16 {
    3600
}

fn default_button_suppression_ms() -> u64 {
    100
}

fn default_buzz_repeat_count() -> u8 {
    4
}

fn default_true() -> bool {
    true
}

fn default_reconnect_base_ms() -> u64 {
    25
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_stable_session_ms() -> u64 {
    2_000
}

fn default_discovery_poll_ms() -> u64 {
    2_000
}

fn default_consumer_queue() -> usize {
    crate::hub::DEFAULT_QUEUE_DEPTH
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            html_port: default_html_port(),
            keepalive_ms: default_keepalive_ms(),
            aggregation_ms: default_aggregation_ms(),
            min_degrees: default_min_degrees(),
            dial_steps: default_dial_steps(),
            button_suppression_ms: default_button_suppression_ms(),
            suppress_while_held: false,
            buzz: false,
            buzz_repeat_count: default_buzz_repeat_count(),
            haptics: true,
            send_features: true,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            stable_session_ms: default_stable_session_ms(),
            discovery_poll_ms: default_discovery_poll_ms(),
            consumer_queue: default_consumer_queue(),
            device: DeviceConfig::default(),
        }
    }
}

/// Which access path delivers the dial's input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Packetized HID input reports
    #[default]
    Hid,
    /// Streamed kernel input-event records
    Evdev,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub input: InputKind,

    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    #[serde(default = "default_product_id")]
    pub product_id: u16,

    /// Kernel input device name, used to find the evdev node
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Explicit event node under /dev/input (e.g., "event5")
    #[serde(default)]
    pub event_file: Option<String>,
}

fn default_vendor_id() -> u16 {
    SURFACE_DIAL_VENDOR_ID
}

fn default_product_id() -> u16 {
    SURFACE_DIAL_PRODUCT_ID
}

fn default_device_name() -> String {
    SURFACE_DIAL_INPUT_NAME.to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            input: InputKind::default(),
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            name: default_device_name(),
            event_file: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dial_steps == 0 {
            return Err(ConfigError::ZeroDialSteps);
        }
        if self.min_degrees.is_nan() || self.min_degrees < 0.0 {
            return Err(ConfigError::NegativeMinDegrees(self.min_degrees));
        }
        if self.keepalive_ms == 0 {
            return Err(ConfigError::ZeroKeepalive);
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            aggregation_interval: Duration::from_millis(self.aggregation_ms),
            min_reportable_degrees: self.min_degrees,
            steps_per_revolution: self.dial_steps,
            button_suppression: Duration::from_millis(self.button_suppression_ms),
            suppress_while_held: self.suppress_while_held,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            setup: DeviceSetup {
                apply_features: self.send_features,
                steps_per_revolution: self.dial_steps,
                haptics: self.haptics,
                buzz: self.buzz.then_some(self.buzz_repeat_count),
            },
            discovery_poll: Duration::from_millis(self.discovery_poll_ms),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            stable_run_threshold: Duration::from_millis(self.stable_session_ms),
        }
    }
}

/// Values given on the command line; they win over every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Explicit config file, must exist
    pub config_file: Option<PathBuf>,
    pub ws_port: Option<u16>,
    pub html_port: Option<u16>,
    /// Only ever switches buzz on
    pub buzz: bool,
}

/// Get config directory (DIALSERVER_CONFIG_DIR, XDG_CONFIG_HOME or ~/.config)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DIALSERVER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(APP_DIR_NAME);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
    }

    // Fallback to current directory
    PathBuf::from(".")
}

pub fn load_config(overrides: &ConfigOverrides) -> Result<Config> {
    let file_source = match &overrides.config_file {
        Some(path) => ::config::File::from(path.as_path()),
        None => {
            let stem = get_config_dir().join("config");
            ::config::File::with_name(&stem.to_string_lossy()).required(false)
        }
    };

    let mut builder = ::config::Config::builder()
        .add_source(file_source)
        // DIALSERVER_WS_PORT, DIALSERVER_DEVICE__INPUT, etc.
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    if let Some(port) = overrides.ws_port {
        builder = builder.set_override("ws_port", i64::from(port))?;
    }
    if let Some(port) = overrides.html_port {
        builder = builder.set_override("html_port", i64::from(port))?;
    }
    if overrides.buzz {
        builder = builder.set_override("buzz", true)?;
    }

    let config: Config = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
