//! Transport provider abstraction and the native serial implementation.
//!
//! A [`TransportProvider`] finds a port matching a [`PortFilter`] and opens it
//! as an async byte stream. The session only ever sees the boxed stream, so
//! anything implementing `AsyncRead + AsyncWrite` (a real serial port, a pty,
//! an in-memory duplex pipe) can stand in for the device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::{Result, SerialDeviceInfo, SerialError};

// pico-fbw boards are RP2040 based and enumerate with the Raspberry Pi vendor id
pub const PICO_VID: u16 = 0x2E8A; // Raspberry Pi Foundation
pub const DEFAULT_BAUD_RATE: u32 = 115200;

pub trait SerialPortIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIo for T {}

/// Exclusively owned, open byte stream to the device.
pub type PortHandle = Box<dyn SerialPortIo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("unsupported data bits: {}", other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits: {}", other)),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(bits: StopBits) -> u8 {
        match bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Which port to pick when requesting one from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Explicit port name; takes precedence over the USB ids.
    pub port_name: Option<String>,
}

impl Default for PortFilter {
    fn default() -> Self {
        Self {
            vendor_id: Some(PICO_VID),
            product_id: None,
            port_name: None,
        }
    }
}

impl PortFilter {
    /// Filter that accepts any port.
    pub fn any() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            port_name: None,
        }
    }

    pub fn matches(&self, info: &SerialDeviceInfo) -> bool {
        if let Some(name) = &self.port_name {
            return &info.port_name == name;
        }
        let vid_ok = self.vendor_id.map_or(true, |vid| info.vid == Some(vid));
        let pid_ok = self.product_id.map_or(true, |pid| info.pid == Some(pid));
        vid_ok && pid_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    pub filter: PortFilter,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            filter: PortFilter::default(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
        }
    }
}

/// OS-level serial port access as seen by a [`DeviceSession`](super::DeviceSession).
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Pick a port matching `filter`.
    ///
    /// Implementations should report a missing device as [`SerialError::NoDevice`]
    /// and denied access as [`SerialError::PermissionDenied`].
    async fn request_port(&self, filter: &PortFilter) -> Result<SerialDeviceInfo>;

    /// Open the byte stream for a previously requested port.
    async fn open_port(&self, port: &SerialDeviceInfo, options: &OpenOptions) -> Result<PortHandle>;
}

/// Provider backed by the operating system's serial ports.
#[derive(Debug, Default, Clone)]
pub struct NativeTransport;

impl NativeTransport {
    pub fn new() -> Self {
        Self
    }

    /// Enumerate all serial ports the OS knows about.
    pub fn list_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(port_to_info).collect())
    }

    /// Enumerate ports accepted by `filter`.
    pub fn discover_devices(filter: &PortFilter) -> Result<Vec<SerialDeviceInfo>> {
        Ok(Self::list_ports()?
            .into_iter()
            .filter(|info| filter.matches(info))
            .collect())
    }
}

pub(crate) fn port_to_info(port: serialport::SerialPortInfo) -> SerialDeviceInfo {
    match port.port_type {
        SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
            port_name: port.port_name,
            vid: Some(usb_info.vid),
            pid: Some(usb_info.pid),
            serial_number: usb_info.serial_number,
            manufacturer: usb_info.manufacturer,
            product: usb_info.product,
        },
        _ => SerialDeviceInfo::from_port_name(port.port_name),
    }
}

#[async_trait]
impl TransportProvider for NativeTransport {
    async fn request_port(&self, filter: &PortFilter) -> Result<SerialDeviceInfo> {
        let mut candidates = Self::discover_devices(filter)?;
        if candidates.is_empty() {
            // Explicitly named ports (ptys, on-board UARTs) may not be enumerated
            if let Some(name) = &filter.port_name {
                log::debug!("Port {} not enumerated, trying it directly", name);
                return Ok(SerialDeviceInfo::from_port_name(name.clone()));
            }
            return Err(SerialError::NoDevice);
        }
        if candidates.len() > 1 {
            log::warn!(
                "{} matching ports found, using {}",
                candidates.len(),
                candidates[0].port_name
            );
        }
        Ok(candidates.swap_remove(0))
    }

    async fn open_port(&self, port: &SerialDeviceInfo, options: &OpenOptions) -> Result<PortHandle> {
        let stream = tokio_serial::new(port.port_name.as_str(), options.baud_rate)
            .data_bits(options.data_bits.into())
            .stop_bits(options.stop_bits.into())
            .parity(options.parity.into())
            .open_native_async()?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> SerialDeviceInfo {
        SerialDeviceInfo {
            vid: Some(vid),
            pid: Some(pid),
            ..SerialDeviceInfo::from_port_name(name)
        }
    }

    #[test]
    fn default_filter_matches_pico_vendor_only() {
        let filter = PortFilter::default();
        assert!(filter.matches(&usb("/dev/ttyACM0", PICO_VID, 0x000A)));
        assert!(!filter.matches(&usb("/dev/ttyUSB0", 0x10C4, 0xEA60)));
        assert!(!filter.matches(&SerialDeviceInfo::from_port_name("/dev/ttyS0")));
    }

    #[test]
    fn port_name_overrides_usb_ids() {
        let filter = PortFilter {
            port_name: Some("/dev/ttyS0".into()),
            ..PortFilter::default()
        };
        assert!(filter.matches(&SerialDeviceInfo::from_port_name("/dev/ttyS0")));
        assert!(!filter.matches(&usb("/dev/ttyACM0", PICO_VID, 0x000A)));
    }

    #[test]
    fn open_options_defaults() {
        let opts = OpenOptions::default();
        assert_eq!(opts.baud_rate, 115200);
        assert_eq!(opts.data_bits, DataBits::Eight);
        assert_eq!(opts.stop_bits, StopBits::One);
        assert_eq!(opts.parity, Parity::None);
        assert_eq!(opts.filter.vendor_id, Some(PICO_VID));
    }

    #[test]
    fn framing_serializes_as_numbers() {
        let json = serde_json::to_string(&OpenOptions::default()).unwrap();
        assert!(json.contains("\"data_bits\":8"));
        assert!(json.contains("\"stop_bits\":1"));
        assert!(json.contains("\"parity\":\"none\""));
        assert!(serde_json::from_str::<DataBits>("9").is_err());
    }
}
