use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::serial::protocol::PRODUCT_TAG;
use crate::serial::{OpenOptions, Result, SerialError};

/// Tunables for a [`DeviceSession`](crate::serial::DeviceSession).
///
/// Loaded from JSON; any field left out takes its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tag the firmware prefixes status lines with.
    pub product_tag: String,
    pub port: OpenOptions,
    pub write_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub ping_retries: u32,
    pub ping_retry_delay_ms: u64,
    pub ping_write_delay_ms: u64,
    pub monitor_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            product_tag: PRODUCT_TAG.to_string(),
            port: OpenOptions::default(),
            write_delay_ms: 200,
            read_timeout_ms: 500,
            ping_retries: 5,
            ping_retry_delay_ms: 500,
            ping_write_delay_ms: 150,
            monitor_poll_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| SerialError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SerialError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&contents)?;
        log::debug!("Loaded session config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.product_tag.trim().is_empty() || self.product_tag.contains(char::is_whitespace) {
            return Err(SerialError::Config(format!(
                "Invalid product tag '{}'",
                self.product_tag
            )));
        }
        if self.port.baud_rate == 0 {
            return Err(SerialError::Config("Baud rate must be non-zero".to_string()));
        }
        if self.ping_retries == 0 {
            return Err(SerialError::Config("Ping retries must be at least 1".to_string()));
        }
        if self.read_timeout_ms == 0 {
            return Err(SerialError::Config("Read timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::transport::{Parity, PICO_VID};
    use std::io::Write;

    #[test]
    fn defaults_match_firmware_expectations() {
        let config = SessionConfig::default();
        assert_eq!(config.product_tag, "pico-fbw");
        assert_eq!(config.write_delay_ms, 200);
        assert_eq!(config.read_timeout_ms, 500);
        assert_eq!(config.ping_retries, 5);
        assert_eq!(config.ping_retry_delay_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = SessionConfig::from_json(
            r#"{"read_timeout_ms": 900, "port": {"baud_rate": 57600, "parity": "even", "filter": {"port_name": "/dev/ttyACM1"}}}"#,
        )
        .unwrap();
        assert_eq!(config.read_timeout_ms, 900);
        assert_eq!(config.write_delay_ms, 200);
        assert_eq!(config.port.baud_rate, 57600);
        assert_eq!(config.port.parity, Parity::Even);
        assert_eq!(config.port.filter.port_name.as_deref(), Some("/dev/ttyACM1"));
        // Filter fields not given keep the default vendor
        assert_eq!(config.port.filter.vendor_id, Some(PICO_VID));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SessionConfig::from_json(r#"{"ping_retries": 0}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"product_tag": ""}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"port": {"baud_rate": 0}}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"port": {"data_bits": 9}}"#).is_err());
        assert!(SessionConfig::from_json("not json").is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"product_tag": "fbw-sim", "ping_retries": 10}}"#).unwrap();
        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.product_tag, "fbw-sim");
        assert_eq!(config.ping_retries, 10);

        let missing = SessionConfig::load("/nonexistent/fbw-link.json").unwrap_err();
        assert!(matches!(missing, SerialError::Config(_)));
    }
}
