pub mod port_monitor;

pub use port_monitor::{PollingPortMonitor, PortEvent, PortEventDebouncer, PortMonitor};
