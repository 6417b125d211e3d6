pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;

pub use events::{ListenerId, SessionEvent, SessionEventKind};
pub use protocol::{ConfigProtocol, DeviceConfig, StatusLine};
pub use session::DeviceSession;
pub use transport::{NativeTransport, OpenOptions, PortFilter, PortHandle, TransportProvider};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    /// Bare info for a port known only by name (non-USB or manually chosen).
    pub fn from_port_name(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("No compatible devices found.")]
    NoDevice,

    #[error("Device access permission denied, try again.")]
    PermissionDenied,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serial port unavailable.")]
    TransportUnavailable,

    #[error("Serial port closed.")]
    StreamClosed,

    #[error("Command failed with code {0}")]
    CommandFailed(u32),

    #[error("Failed to send command: {0}")]
    Command(#[source] Box<SerialError>),

    #[error("Failed to ping device: no valid response after {attempts} attempts")]
    PingTimeout { attempts: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Port monitor already started")]
    MonitorAlreadyStarted,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Innermost error, looking through `Command` wrappers.
    pub fn root(&self) -> &SerialError {
        match self {
            SerialError::Command(inner) => inner.root(),
            other => other,
        }
    }

    /// Classify a failure from port acquisition into the user-facing kinds.
    pub(crate) fn into_acquisition_error(self) -> SerialError {
        match self {
            SerialError::NoDevice | SerialError::PermissionDenied | SerialError::Transport(_) => self,
            SerialError::IoError(e) => match e.kind() {
                std::io::ErrorKind::NotFound => SerialError::NoDevice,
                std::io::ErrorKind::PermissionDenied => SerialError::PermissionDenied,
                _ => SerialError::Transport(e.to_string()),
            },
            SerialError::SerialportError(e) => match e.kind() {
                serialport::ErrorKind::NoDevice => SerialError::NoDevice,
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => SerialError::NoDevice,
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    SerialError::PermissionDenied
                }
                _ => SerialError::Transport(e.to_string()),
            },
            other => SerialError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wrapper_keeps_message_and_root() {
        let err = SerialError::Command(Box::new(SerialError::CommandFailed(500)));
        assert_eq!(err.to_string(), "Failed to send command: Command failed with code 500");
        assert!(matches!(err.root(), SerialError::CommandFailed(500)));
    }

    #[test]
    fn acquisition_errors_are_classified() {
        let denied = SerialError::IoError(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(denied.into_acquisition_error(), SerialError::PermissionDenied));

        let missing = SerialError::SerialportError(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "gone",
        ));
        assert!(matches!(missing.into_acquisition_error(), SerialError::NoDevice));

        let other = SerialError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        match other.into_acquisition_error() {
            SerialError::Transport(msg) => assert!(msg.contains("boom")),
            e => panic!("unexpected {e:?}"),
        }
    }
}
