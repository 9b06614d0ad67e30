//! TOML startup config: installed features, broker connection, telemetry
//! options and the device config seeded into an empty store.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::db::Credentials;
use crate::device::DeviceConfig;
use crate::features::FeatureConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device_id: String,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub defaults: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub reconnect_timeout_secs: u64,
    /// Seeded into the credential store when none are stored.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            reconnect_timeout_secs: 5,
            username: None,
            password: None,
        }
    }
}

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                secret: password.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub cascade_log_levels: bool,
}

/// rumqttc refuses keep-alive intervals below this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device_id(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_defaults(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device_id(&self, errors: &mut Vec<String>) {
        let id = &self.device_id;
        if id.trim().is_empty() {
            errors.push("device_id is empty".to_string());
        } else if let Some(c) = id
            .chars()
            .find(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
        {
            errors.push(format!(
                "device_id '{id}' contains {c:?}, which is not allowed in a topic prefix"
            ));
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if m.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                m.keep_alive_secs
            ));
        }
        if m.reconnect_timeout_secs == 0 {
            errors.push("mqtt.reconnect_timeout_secs must be positive, got 0".to_string());
        }
        match (&m.username, &m.password) {
            (Some(_), None) => errors.push("mqtt.username is set without mqtt.password".to_string()),
            (None, Some(_)) => errors.push("mqtt.password is set without mqtt.username".to_string()),
            (Some(user), Some(_)) if user.trim().is_empty() => {
                errors.push("mqtt.username is empty".to_string())
            }
            _ => {}
        }
    }

    fn validate_defaults(&self, errors: &mut Vec<String>) {
        let d = &self.defaults;
        if d.services.data_resolution_l == 0 {
            errors.push("defaults.services.data_resolution_l must be positive, got 0".to_string());
        }

        // Only checked when the sensor exists; otherwise the section is inert.
        if self.features.flow_sensor && d.flow_sensor.min_flow_rate > d.flow_sensor.max_flow_rate
        {
            errors.push(format!(
                "defaults.flow_sensor: min_flow_rate ({}) exceeds max_flow_rate ({})",
                d.flow_sensor.min_flow_rate, d.flow_sensor.max_flow_rate
            ));
        }
    }

    /// Overlay broker settings from the environment (`MQTT_HOST`,
    /// `MQTT_PORT`). Unparseable ports are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides to, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        device_id = %config.device_id,
        features = ?config.features,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
