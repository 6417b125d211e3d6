//! Simulated pico-fbw device reachable through an in-memory duplex pipe.
#![allow(dead_code)]

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use pico_fbw_serial::serial::transport::{OpenOptions, PortFilter, PortHandle, TransportProvider};
use pico_fbw_serial::serial::{Result, SerialDeviceInfo, SerialError};
use pico_fbw_serial::{DeviceSession, SessionConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};

pub const PORT_NAME: &str = "/dev/ttyACM0";

pub enum Reply {
    Text(String),
    /// Written one piece at a time with a short pause in between.
    Chunks(Vec<String>),
    Nothing,
    Hangup,
}

pub fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

pub type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    NoDevice,
    Denied,
    Broken,
}

pub struct MockTransport {
    handler: Handler,
    pub received: Arc<Mutex<Vec<String>>>,
    pub opens: AtomicUsize,
    failure: Mutex<Option<Failure>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    // When set, the device end is kept open but never read
    stalled: AtomicBool,
    parked: Mutex<Vec<DuplexStream>>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            received: Arc::new(Mutex::new(Vec::new())),
            opens: AtomicUsize::new(0),
            failure: Mutex::new(None),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
            stalled: AtomicBool::new(false),
            parked: Mutex::new(Vec::new()),
        })
    }

    /// Device that never drains what the host writes.
    pub fn stalled() -> Arc<Self> {
        let transport = Self::new(|_: &str| Reply::Nothing);
        transport.stalled.store(true, Ordering::SeqCst);
        transport
    }

    /// Handles currently open.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most handles that were ever open at the same time.
    pub fn max_live_handles(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, failure: Option<Failure>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

pub fn device_info() -> SerialDeviceInfo {
    SerialDeviceInfo {
        vid: Some(0x2E8A),
        pid: Some(0x000A),
        ..SerialDeviceInfo::from_port_name(PORT_NAME)
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    async fn request_port(&self, filter: &PortFilter) -> Result<SerialDeviceInfo> {
        match *self.failure.lock().unwrap() {
            Some(Failure::NoDevice) => return Err(SerialError::NoDevice),
            Some(Failure::Denied) => {
                return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into())
            }
            Some(Failure::Broken) => {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "usb stack on fire").into())
            }
            None => {}
        }
        let info = device_info();
        if filter.matches(&info) {
            Ok(info)
        } else {
            Err(SerialError::NoDevice)
        }
    }

    async fn open_port(&self, _port: &SerialDeviceInfo, _options: &OpenOptions) -> Result<PortHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let host = if self.stalled.load(Ordering::SeqCst) {
            let (host, device) = tokio::io::duplex(8);
            self.parked.lock().unwrap().push(device);
            host
        } else {
            let (host, device) = tokio::io::duplex(4096);
            tokio::spawn(run_device(device, self.handler.clone(), self.received.clone()));
            host
        };
        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now_live, Ordering::SeqCst);
        Ok(Box::new(TrackedPort { inner: host, live: self.live.clone() }))
    }
}

/// Host end of the pipe that counts itself in `live` until dropped.
struct TrackedPort {
    inner: DuplexStream,
    live: Arc<AtomicUsize>,
}

impl Drop for TrackedPort {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedPort {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedPort {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn run_device(stream: DuplexStream, handler: Handler, received: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        received.lock().unwrap().push(line.clone());
        match handler(&line) {
            Reply::Text(reply) => {
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            Reply::Chunks(pieces) => {
                for piece in pieces {
                    if writer.write_all(piece.as_bytes()).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
            Reply::Nothing => {}
            Reply::Hangup => break,
        }
    }
}

/// Timing small enough to keep tests quick.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        write_delay_ms: 10,
        read_timeout_ms: 100,
        ping_retries: 3,
        ping_retry_delay_ms: 10,
        ping_write_delay_ms: 10,
        ..SessionConfig::default()
    }
}

pub async fn open_session(transport: &Arc<MockTransport>) -> Arc<DeviceSession> {
    let session = Arc::new(DeviceSession::with_config(transport.clone(), fast_config()));
    session.open_default().await.expect("open mock device");
    session
}
