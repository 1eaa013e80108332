//! `config.json` schema. The file is created with defaults on first start;
//! unknown keys are rejected so typos surface immediately.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub serial: SerialCfg,
    pub focuser: FocuserCfg,
    pub logging: LoggingCfg,
    pub simulator: SimulatorCfg,
}

/// HTTP server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerCfg {
    pub ip: String,
    pub port: u16,
    pub discovery_enabled: bool,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_owned(),
            port: 5000,
            discovery_enabled: true,
        }
    }
}

/// Serial port section. An empty `port` with `auto_discover` enabled makes
/// connect scan all ports for a responding device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialCfg {
    pub port: String,
    pub baud: u32,
    pub timeout_seconds: u64,
    pub auto_discover: bool,
    pub scan_timeout_seconds: f64,
}

impl Default for SerialCfg {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: 9600,
            timeout_seconds: 5,
            auto_discover: true,
            scan_timeout_seconds: 1.0,
        }
    }
}

impl SerialCfg {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_timeout_seconds)
    }
}

/// Focuser behavior section. `max_step`, `min_step`, `max_increment` and
/// `backlash_steps` are fallbacks; hardware values take over on connect
/// where the firmware supports the corresponding queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FocuserCfg {
    pub step_size_microns: f64,
    pub max_step: u32,
    pub min_step: u32,
    pub max_increment: u32,
    pub polling_interval_moving_ms: u64,
    pub polling_interval_idle_sec: u64,
    pub backlash_steps: i16,
    pub settle_delay_ms: u64,
    pub halt_deadline_sec: u64,
    pub temperature_cache_sec: u64,
}

impl Default for FocuserCfg {
    fn default() -> Self {
        Self {
            step_size_microns: 4.5,
            max_step: 60_000,
            min_step: 0,
            max_increment: 60_000,
            polling_interval_moving_ms: 100,
            polling_interval_idle_sec: 5,
            backlash_steps: 0,
            settle_delay_ms: 150,
            halt_deadline_sec: 3,
            temperature_cache_sec: 5,
        }
    }
}

impl FocuserCfg {
    pub fn moving_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_moving_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_idle_sec)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn halt_deadline(&self) -> Duration {
        Duration::from_secs(self.halt_deadline_sec)
    }

    pub fn temperature_cache(&self) -> Duration {
        Duration::from_secs(self.temperature_cache_sec)
    }
}

/// Logging section; `level` feeds an `EnvFilter` directive, `file` switches
/// output from the console to an append-only log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingCfg {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: None,
        }
    }
}

/// Simulator section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorCfg {
    pub enabled: bool,
    pub initial_position: u32,
    pub max_travel: u32,
    pub movement_speed_steps_per_sec: u32,
    /// Six decimal digits, as reported by `FV`.
    pub firmware_version: String,
    pub temperature_celsius: f64,
    pub temperature_noise_celsius: f64,
    pub temperature_drift_per_hour: f64,
}

impl Default for SimulatorCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_position: 30_000,
            max_travel: 60_000,
            movement_speed_steps_per_sec: 500,
            firmware_version: "002100".to_owned(),
            temperature_celsius: 16.85,
            temperature_noise_celsius: 0.0,
            temperature_drift_per_hour: 0.0,
        }
    }
}

impl SimulatorCfg {
    /// Numeric firmware value carried in FV replies, clamped to the
    /// six-digit field.
    pub fn firmware_value(&self) -> u32 {
        self.firmware_version.parse().unwrap_or(0).min(999_999)
    }
}

/// Loads the configuration, writing a default document on first start.
pub fn load_or_create(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    } else {
        let config = AppConfig::default();
        let text = serde_json::to_string_pretty(&config)?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write default config {}", path.display()))?;
        tracing::info!(path = %path.display(), "created default configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_json() {
        let config = AppConfig::default();
        let text = serde_json::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed.server.port, 5000);
        assert_eq!(parsed.serial.baud, 9600);
        assert_eq!(parsed.focuser.max_step, 60_000);
        assert_eq!(parsed.simulator.firmware_version, "002100");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{"server": {"port": 11111}}"#).expect("parse");
        assert_eq!(parsed.server.port, 11111);
        assert_eq!(parsed.server.ip, "0.0.0.0");
        assert_eq!(parsed.focuser.max_increment, 60_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<AppConfig>(r#"{"serval": {}}"#).is_err());
    }
}
