//! Runtime settings for a dispatcher instance.
//!
//! Settings can be deserialized from a JSON document (durations in
//! milliseconds) and individually overridden with named string options where
//! durations are given in seconds, e.g. `operation_timeout=2.5`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("invalid value `{value}` for option `{name}`")]
    InvalidValue { name: String, value: String },
    #[error("option `{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("option `{name}` may not exceed {max}")]
    TooLarge { name: &'static str, max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Total time a command may take, measured from submission, across retries.
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    /// First retry delay; doubled per retry.
    #[serde(with = "millis")]
    pub retry_backoff_base: Duration,
    #[serde(with = "millis")]
    pub retry_backoff_max: Duration,
    /// Upper bound on retries (remaps included) for a single packet.
    pub max_retries: u32,
    /// Re-send a not-my-partition packet right away instead of via the retry queue.
    pub nmv_retry_immediate: bool,
    pub max_key_len: usize,
    pub max_value_size: usize,
    #[serde(with = "millis")]
    pub durability_interval: Duration,
    #[serde(with = "millis")]
    pub durability_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Ask the event loop for a flush whenever a scheduling context is left.
    pub implicit_flush: bool,
    /// Minimum spacing of repeated map refresh requests against one generation.
    #[serde(with = "millis")]
    pub config_refresh_throttle: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(2500),
            retry_backoff_base: Duration::from_millis(10),
            retry_backoff_max: Duration::from_millis(500),
            max_retries: 16,
            nmv_retry_immediate: true,
            max_key_len: 250,
            max_value_size: 20 * 1024 * 1024,
            durability_interval: Duration::from_millis(100),
            durability_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            implicit_flush: true,
            config_refresh_throttle: Duration::from_secs(10),
        }
    }
}

impl Settings {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Applies a single `name=value` override.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "operation_timeout" => self.operation_timeout = parse_seconds(value).ok_or_else(invalid)?,
            "retry_backoff" | "retry_backoff_base" => {
                self.retry_backoff_base = parse_seconds(value).ok_or_else(invalid)?
            }
            "retry_backoff_max" => self.retry_backoff_max = parse_seconds(value).ok_or_else(invalid)?,
            "max_retries" => self.max_retries = value.parse().map_err(|_| invalid())?,
            "nmv_retry_immediate" => self.nmv_retry_immediate = parse_bool(value).ok_or_else(invalid)?,
            "max_key_len" => self.max_key_len = value.parse().map_err(|_| invalid())?,
            "max_value_size" => self.max_value_size = value.parse().map_err(|_| invalid())?,
            "durability_interval" => {
                self.durability_interval = parse_seconds(value).ok_or_else(invalid)?
            }
            "durability_timeout" => self.durability_timeout = parse_seconds(value).ok_or_else(invalid)?,
            "connect_timeout" => self.connect_timeout = parse_seconds(value).ok_or_else(invalid)?,
            "implicit_flush" => self.implicit_flush = parse_bool(value).ok_or_else(invalid)?,
            "config_refresh_throttle" => {
                self.config_refresh_throttle = parse_seconds(value).ok_or_else(invalid)?
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        self.validate()
    }

    /// Applies a `name=value` pair as written on a command line.
    pub fn apply_pair(&mut self, pair: &str) -> Result<(), ConfigError> {
        let (name, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            name: pair.to_string(),
            value: String::new(),
        })?;
        self.apply(name.trim(), value.trim())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Zero("operation_timeout"));
        }
        if self.retry_backoff_base.is_zero() {
            return Err(ConfigError::Zero("retry_backoff_base"));
        }
        if self.max_key_len == 0 {
            return Err(ConfigError::Zero("max_key_len"));
        }
        if self.max_key_len > protocol::MAX_KEY_LEN {
            return Err(ConfigError::TooLarge {
                name: "max_key_len",
                max: protocol::MAX_KEY_LEN,
            });
        }
        let max_value = protocol::max_value_len(self.max_key_len);
        if self.max_value_size > max_value {
            return Err(ConfigError::TooLarge {
                name: "max_value_size",
                max: max_value,
            });
        }
        if self.durability_interval.is_zero() {
            return Err(ConfigError::Zero("durability_interval"));
        }
        Ok(())
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let settings =
            Settings::from_json_str(r#"{"operation_timeout": 1000, "max_retries": 3}"#).expect("parse");
        assert_eq!(settings.operation_timeout, Duration::from_millis(1000));
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_backoff_max, Settings::default().retry_backoff_max);
    }

    #[test]
    fn string_options_use_seconds() {
        let mut settings = Settings::default();
        settings.apply("operation_timeout", "2.5").expect("apply");
        settings.apply_pair("nmv_retry_immediate = off").expect("apply");
        assert_eq!(settings.operation_timeout, Duration::from_millis(2500));
        assert!(!settings.nmv_retry_immediate);
    }

    #[test]
    fn rejects_unknown_and_invalid_options() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.apply("frobnicate", "1"),
            Err(ConfigError::UnknownOption(_))
        ));
        assert!(matches!(
            settings.apply("max_retries", "lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings.apply("operation_timeout", "0"),
            Err(ConfigError::Zero("operation_timeout"))
        ));
    }

    #[test]
    fn limits_must_fit_the_frame_header() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.apply("max_key_len", "65536"),
            Err(ConfigError::TooLarge { name: "max_key_len", max: 65535 })
        ));

        let mut settings = Settings::default();
        settings.apply("max_key_len", "65535").expect("largest key length");
        let too_big = (u32::MAX as usize).to_string();
        assert!(matches!(
            settings.apply("max_value_size", &too_big),
            Err(ConfigError::TooLarge { name: "max_value_size", .. })
        ));
        let fits = protocol::max_value_len(65535).to_string();
        settings.apply("max_value_size", &fits).expect("largest value size");

        let raw = r#"{"max_key_len": 70000}"#;
        assert!(matches!(
            Settings::from_json_str(raw),
            Err(ConfigError::TooLarge { name: "max_key_len", .. })
        ));
    }

    #[test]
    fn refresh_throttle_is_an_option() {
        let mut settings = Settings::default();
        settings.apply("config_refresh_throttle", "0.5").expect("apply");
        assert_eq!(settings.config_refresh_throttle, Duration::from_millis(500));
    }
}
