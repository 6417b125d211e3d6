//! Serial session and configuration protocol client for pico-fbw flight controllers.
//!
//! [`DeviceSession`] owns the serial connection and runs the line-oriented
//! command protocol; [`ConfigProtocol`] layers the firmware's config commands
//! on top of it. [`PollingPortMonitor`] supplies hardware connect/disconnect
//! events that a session can follow automatically.

pub mod config;
pub mod device;
pub mod serial;

pub use config::SessionConfig;
pub use device::{PollingPortMonitor, PortEvent, PortMonitor};
pub use serial::{
    ConfigProtocol, DeviceSession, NativeTransport, OpenOptions, PortFilter, SerialError,
    SessionEvent, SessionEventKind, TransportProvider,
};
