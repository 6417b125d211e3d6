use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{DeviceSession, Result, SerialError};

pub const PRODUCT_TAG: &str = "pico-fbw";
pub const STATUS_OK: u32 = 200;

pub const CMD_PING: &str = "PING";
pub const CMD_GET_INFO: &str = "GET_INFO";
pub const CMD_GET_CONFIG: &str = "GET_CONFIG";
pub const CMD_SET_CONFIG: &str = "SET_CONFIG";
pub const PONG_PREFIX: &str = "PONG";

// Settle times the firmware needs before it starts answering
const SAVE_WRITE_DELAY: Duration = Duration::from_millis(400);
const AUTOSAVE_WRITE_DELAY: Duration = Duration::from_millis(200);
const STAGE_WRITE_DELAY: Duration = Duration::from_millis(50);
const READBACK_WRITE_DELAY: Duration = Duration::from_millis(50);

/// Status marker embedded in a response, e.g. `"\npico-fbw 200"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u32,
    /// Byte offset of the newline that introduces the status line.
    pub offset: usize,
}

impl StatusLine {
    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }
}

fn parse_status_code(line: &str, tag: &str) -> Option<u32> {
    let rest = line.strip_prefix(tag)?.strip_prefix(' ')?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    rest[..digits].parse().ok()
}

/// Locate the last `"\n<tag> <digits>"` marker in `response`.
///
/// Anything after the digits on that line is ignored.
pub fn find_status_line(response: &str, tag: &str) -> Option<StatusLine> {
    response
        .match_indices('\n')
        .filter_map(|(offset, _)| {
            parse_status_code(&response[offset + 1..], tag).map(|code| StatusLine { code, offset })
        })
        .last()
}

/// Strip the status line from a raw response.
///
/// Returns the text before the status line, or the whole response when there
/// is none. A non-200 status becomes [`SerialError::CommandFailed`].
pub fn split_status_line(response: &str, tag: &str) -> Result<String> {
    match find_status_line(response, tag) {
        Some(status) if !status.is_ok() => Err(SerialError::CommandFailed(status.code)),
        Some(status) => {
            let trailing = response[status.offset + 1..]
                .split_once('\n')
                .map(|(_, rest)| rest.trim())
                .unwrap_or("");
            if !trailing.is_empty() {
                log::debug!("Dropping {} byte(s) after status line", trailing.len());
            }
            Ok(response[..status.offset].to_string())
        }
        None => Ok(response.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSection {
    pub name: String,
    pub keys: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub sections: Vec<ConfigSection>,
}

impl DeviceConfig {
    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Structural comparison that treats `1` and `1.0` as the same value.
    pub fn matches(&self, other: &DeviceConfig) -> bool {
        self.sections.len() == other.sections.len()
            && self.sections.iter().zip(&other.sections).all(|(a, b)| {
                a.name == b.name
                    && a.keys.len() == b.keys.len()
                    && a.keys.iter().zip(&b.keys).all(|(x, y)| values_equal(x, y))
            })
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-6,
        _ => false,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(command: &str, response: &str) -> Result<T> {
    serde_json::from_str(response.trim()).map_err(|e| {
        log::warn!("Malformed {} response '{}': {}", command, response, e);
        SerialError::Protocol(format!("Invalid {} response: {}", command, e))
    })
}

/// pico-fbw configuration protocol on top of a [`DeviceSession`].
///
/// Writes are always read back and compared; a device that silently rejects
/// a value surfaces as [`SerialError::VerificationFailed`].
pub struct ConfigProtocol {
    session: Arc<DeviceSession>,
}

impl ConfigProtocol {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Fetch device and firmware information as raw JSON.
    pub async fn get_info(&self) -> Result<Value> {
        let response = self.session.send_command_default(CMD_GET_INFO).await?;
        parse_json(CMD_GET_INFO, &response)
    }

    /// Fetch the full configuration.
    pub async fn get_config(&self) -> Result<DeviceConfig> {
        let response = self.session.send_command_default(CMD_GET_CONFIG).await?;
        parse_json(CMD_GET_CONFIG, &response)
    }

    /// Fetch a single value.
    pub async fn get_config_value(&self, section: &str, key: &str) -> Result<Value> {
        let command = format!("{} {}", CMD_GET_CONFIG, json!({ "section": section, "key": key }));
        let response = self
            .session
            .send_command(&command, READBACK_WRITE_DELAY, self.session.read_timeout())
            .await?;
        let parsed: Value = parse_json(CMD_GET_CONFIG, &response)?;
        parsed
            .get("key")
            .cloned()
            .ok_or_else(|| SerialError::Protocol(format!("No value for {}.{} in response", section, key)))
    }

    /// Stage one change (and persist it when `save` is set), then verify it by reading it back.
    pub async fn set_config_value(&self, section: &str, key: &str, value: &str, save: bool) -> Result<()> {
        let payload = json!({
            "changes": [{ "section": section, "key": key, "value": value }],
            "save": save,
        });
        let command = format!("{} {}", CMD_SET_CONFIG, payload);
        let delay = if save { AUTOSAVE_WRITE_DELAY } else { STAGE_WRITE_DELAY };
        self.session
            .send_command(&command, delay, self.session.read_timeout())
            .await?;

        let read_back = self.get_config_value(section, key).await?;
        if !values_equal(&read_back, &Value::String(value.to_string())) {
            log::warn!("Value read back was {}, should have been {}", read_back, value);
            return Err(SerialError::VerificationFailed(format!(
                "{}.{} reads back as {} instead of {}",
                section, key, read_back, value
            )));
        }
        log::info!("Set {}.{} = {}{}", section, key, value, if save { " (saved)" } else { "" });
        Ok(())
    }

    /// Persist staged changes and check the stored config equals `expected`.
    pub async fn save_config(&self, expected: &DeviceConfig) -> Result<()> {
        self.session
            .send_command(CMD_SET_CONFIG, SAVE_WRITE_DELAY, self.session.read_timeout())
            .await?;
        let stored = self.get_config().await?;
        if !stored.matches(expected) {
            log::error!("Failed to verify config save");
            return Err(SerialError::VerificationFailed(
                "stored config differs from the expected config".to_string(),
            ));
        }
        log::info!("Configuration saved to device");
        Ok(())
    }
}
