//! Runtime configuration
//!
//! Loaded from a TOML file (`SMARTALARM_CONFIG` or `./edge.toml`), with
//! every field overridable through environment variables so containerized
//! deployments never need the file at all.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "edge.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EdgeConfig {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub fitbit: FitbitConfig,
    pub monitor: MonitorConfig,
    pub twin: TwinConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub data_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub topic_base: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: String::new(),
            broker_port: 1883,
            topic_base: "howest/smartalarm".into(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FitbitConfig {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
}

impl Default for FitbitConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            refresh_token: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            api_base: "https://api.fitbit.com".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub fetch_interval_secs: u64,
    pub http_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 90,
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    pub min_send_interval_secs: u64,
    pub flush_tick_secs: u64,
    pub max_sends_per_minute: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            min_send_interval_secs: 60,
            flush_tick_secs: 10,
            max_sends_per_minute: 10,
            breaker_cooldown_secs: 300,
        }
    }
}

impl EdgeConfig {
    /// Loads the config file if present, then layers environment overrides
    /// on top.
    pub fn load() -> Result<Self> {
        let path = env::var("SMARTALARM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = if let Ok(raw) = fs::read_to_string(&path) {
            info!("loading config from {path}");
            toml::from_str(&raw).with_context(|| format!("parsing {path}"))?
        } else {
            warn!("no config file at {path}, using defaults and environment");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_str("DEVICE_ID") {
            self.device.device_id = v;
        }
        if let Some(v) = env_str("DATA_DIR") {
            self.device.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_str("MQTT_BROKER_HOST") {
            self.mqtt.broker_host = v;
        }
        if let Some(v) = env_parse::<u16>("MQTT_BROKER_PORT") {
            self.mqtt.broker_port = v;
        }
        if let Some(v) = env_str("MQTT_TOPIC_BASE") {
            self.mqtt.topic_base = v;
        }
        if let Some(v) = env_str("FITBIT_ACCESS_TOKEN") {
            self.fitbit.access_token = v;
        }
        if let Some(v) = env_str("FITBIT_REFRESH_TOKEN") {
            self.fitbit.refresh_token = v;
        }
        if let Some(v) = env_str("FITBIT_CLIENT_ID") {
            self.fitbit.client_id = v;
        }
        if let Some(v) = env_str("FITBIT_CLIENT_SECRET") {
            self.fitbit.client_secret = v;
        }
        if let Some(v) = env_parse::<u64>("FETCH_INTERVAL_SECS") {
            self.monitor.fetch_interval_secs = v;
        }
        if let Some(v) = env_parse::<u16>("HTTP_PORT") {
            self.monitor.http_port = v;
        }
    }
}

/// Reads an environment variable, trimming whitespace and any surrounding
/// quotes that leak in from `.env` files.
fn env_str(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim().trim_matches('"').trim_matches('\'').to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EdgeConfig::default();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.mqtt.topic_base, "howest/smartalarm");
        assert_eq!(config.monitor.fetch_interval_secs, 90);
        assert_eq!(config.twin.min_send_interval_secs, 60);
        assert_eq!(config.twin.breaker_cooldown_secs, 300);
    }

    #[test]
    fn parses_partial_toml() {
        let config: EdgeConfig = toml::from_str(
            r#"
            [device]
            device_id = "bedroom-pi"

            [mqtt]
            broker_host = "broker.local"

            [monitor]
            fetch_interval_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.device.device_id, "bedroom-pi");
        assert_eq!(config.mqtt.broker_host, "broker.local");
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.monitor.fetch_interval_secs, 45);
    }

    #[test]
    fn env_values_are_unquoted() {
        env::set_var("SMARTALARM_TEST_QUOTED", "\"value\"");
        assert_eq!(env_str("SMARTALARM_TEST_QUOTED").as_deref(), Some("value"));
        env::set_var("SMARTALARM_TEST_EMPTY", "  ");
        assert_eq!(env_str("SMARTALARM_TEST_EMPTY"), None);
        env::remove_var("SMARTALARM_TEST_QUOTED");
        env::remove_var("SMARTALARM_TEST_EMPTY");
    }
}
