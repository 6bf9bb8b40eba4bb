//! Charger configuration
//!
//! A [`ChargerConfig`] names a unit, selects a registered driver type and
//! carries that driver's settings as an opaque JSON value. Each factory
//! decodes its own settings struct from it:
//!
//! ```rust
//! use voltage_evse::config::{ChargerConfig, ModbusSettings};
//!
//! let config: ChargerConfig = serde_json::from_str(r#"{
//!     "name": "garage",
//!     "type": "keba-modbus",
//!     "settings": { "uri": "192.168.1.20:502", "timeout_ms": 2000 }
//! }"#).unwrap();
//!
//! let modbus: ModbusSettings = config.decode_settings().unwrap();
//! assert_eq!(modbus.unit_id(255), 255);
//! ```

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::bytes::ByteOrder;
use crate::constants::{DEFAULT_MAX_CURRENT, DEFAULT_MIN_CURRENT, DEFAULT_TRANSPORT_TIMEOUT};
use crate::current::CurrentLimits;
use crate::error::{ChargerError, ChargerResult};
use crate::heartbeat::WatchdogPolicy;

fn default_timeout_ms() -> u64 {
    DEFAULT_TRANSPORT_TIMEOUT.as_millis() as u64
}

/// One configured charge point.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChargerConfig {
    pub name: String,
    /// Registered driver type, e.g. `keba-modbus`.
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub settings: Value,
}

impl ChargerConfig {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, r#type: T, settings: Value) -> Self {
        Self {
            name: name.into(),
            r#type: r#type.into(),
            settings,
        }
    }

    /// Decode the driver-specific settings.
    pub fn decode_settings<S: DeserializeOwned>(&self) -> ChargerResult<S> {
        let settings = match &self.settings {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        serde_json::from_value(settings).map_err(|e| {
            ChargerError::configuration(format!("{} ({}): {}", self.name, self.r#type, e))
        })
    }

    /// Parse a list of charger configurations.
    pub fn parse_list(json: &str) -> ChargerResult<Vec<ChargerConfig>> {
        serde_json::from_str(json).map_err(|e| ChargerError::configuration(e.to_string()))
    }
}

/// Modbus link settings shared by the register-mapped drivers.
///
/// Either `uri` (TCP, `host:port`) or `device` (RTU serial port) selects
/// the link.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModbusSettings {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
    /// Slave id; the vendor profile's default applies when absent.
    #[serde(default)]
    pub id: Option<u8>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    #[serde(default)]
    pub watchdog: Option<WatchdogSettings>,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            uri: None,
            device: None,
            baudrate: None,
            id: None,
            timeout_ms: default_timeout_ms(),
            byte_order: None,
            watchdog: None,
        }
    }
}

impl ModbusSettings {
    pub fn unit_id(&self, profile_default: u8) -> u8 {
        self.id.unwrap_or(profile_default)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn watchdog(&self) -> ChargerResult<Option<WatchdogPolicy>> {
        self.watchdog.as_ref().map(WatchdogSettings::policy).transpose()
    }
}

/// Explicit watchdog override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WatchdogSettings {
    pub timeout_ms: u64,
    /// Defaults to half the timeout.
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

impl WatchdogSettings {
    pub fn policy(&self) -> ChargerResult<WatchdogPolicy> {
        let timeout = Duration::from_millis(self.timeout_ms);
        match self.interval_ms {
            Some(interval) => WatchdogPolicy::new(timeout, Duration::from_millis(interval)),
            None => WatchdogPolicy::from_timeout(timeout),
        }
    }
}

/// Settings of JSON-document units.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpSettings {
    pub uri: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub min_current: Option<f64>,
    #[serde(default)]
    pub max_current: Option<f64>,
    #[serde(default)]
    pub watchdog: Option<WatchdogSettings>,
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn limits(&self) -> CurrentLimits {
        CurrentLimits::new()
            .with_min(self.min_current.unwrap_or(DEFAULT_MIN_CURRENT))
            .with_max(self.max_current.unwrap_or(DEFAULT_MAX_CURRENT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_modbus_defaults() {
        let config = ChargerConfig::new("wb", "amperfied", json!({ "uri": "10.0.0.5:502" }));
        let settings: ModbusSettings = config.decode_settings().unwrap();

        assert_eq!(settings.uri.as_deref(), Some("10.0.0.5:502"));
        assert_eq!(settings.unit_id(255), 255);
        assert_eq!(settings.timeout(), Duration::from_secs(5));
        assert!(settings.watchdog().unwrap().is_none());
    }

    #[test]
    fn test_null_settings_decode_as_empty() {
        let config = ChargerConfig::new("sim", "abl", Value::Null);
        let settings: ModbusSettings = config.decode_settings().unwrap();
        assert_eq!(settings, ModbusSettings::default());
    }

    #[test]
    fn test_watchdog_override() {
        let config = ChargerConfig::new(
            "wb",
            "vestel",
            json!({ "id": 1, "byte_order": "ABCD", "watchdog": { "timeout_ms": 20000, "interval_ms": 5000 } }),
        );
        let settings: ModbusSettings = config.decode_settings().unwrap();
        let policy = settings.watchdog().unwrap().unwrap();

        assert_eq!(settings.unit_id(255), 1);
        assert_eq!(policy.interval(), Duration::from_secs(5));

        let bad = WatchdogSettings {
            timeout_ms: 10_000,
            interval_ms: Some(8_000),
        };
        assert!(bad.policy().is_err());
    }

    #[test]
    fn test_bad_settings_are_configuration_errors() {
        let config = ChargerConfig::new("wb", "openwbpro", json!({ "timeout_ms": "soon" }));
        let err = config.decode_settings::<HttpSettings>().unwrap_err();
        assert!(matches!(err, ChargerError::Configuration { .. }));
        assert!(err.to_string().contains("wb (openwbpro)"));
    }

    #[test]
    fn test_parse_list() {
        let list = ChargerConfig::parse_list(
            r#"[{"name": "a", "type": "keba-modbus"}, {"name": "b", "type": "openwbpro", "settings": {"uri": "http://b"}}]"#,
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].settings, Value::Null);
        assert_eq!(list[1].r#type, "openwbpro");
    }
}
