//! Serial device session: connection lifecycle and the command/response exchange.
//!
//! One [`DeviceSession`] owns at most one open port. All I/O is serialized
//! through a single-permit semaphore (the "busy" slot); `send_command` holds
//! that slot for the whole write / settle / read exchange so two commands
//! never interleave on the wire.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{ListenerId, ListenerRegistry, SessionEvent, SessionEventKind};
use super::protocol::{split_status_line, CMD_PING, PONG_PREFIX};
use super::transport::{OpenOptions, PortHandle, TransportProvider};
use super::{Result, SerialDeviceInfo, SerialError};
use crate::config::SessionConfig;
use crate::device::PortEvent;

const READ_CHUNK_SIZE: usize = 1024;

struct Connection {
    port: PortHandle,
    info: SerialDeviceInfo,
}

pub struct DeviceSession {
    provider: Arc<dyn TransportProvider>,
    config: SessionConfig,
    connection: Mutex<Option<Connection>>,
    // Mirrors the connection's info; readable while I/O holds `connection`
    held: std::sync::Mutex<Option<SerialDeviceInfo>>,
    last_options: std::sync::Mutex<Option<OpenOptions>>,
    busy: Semaphore,
    // Bumped by close() so an in-flight read can bail out
    closing: watch::Sender<u64>,
    listeners: ListenerRegistry,
}

impl DeviceSession {
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        Self::with_config(provider, SessionConfig::default())
    }

    pub fn with_config(provider: Arc<dyn TransportProvider>, config: SessionConfig) -> Self {
        let (closing, _) = watch::channel(0);
        Self {
            provider,
            config,
            connection: Mutex::new(None),
            held: std::sync::Mutex::new(None),
            last_options: std::sync::Mutex::new(None),
            busy: Semaphore::new(1),
            closing,
            listeners: ListenerRegistry::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.config.write_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms)
    }

    /// True while a read or write holds the transport.
    pub fn is_busy(&self) -> bool {
        self.busy.available_permits() == 0
    }

    pub async fn is_connected(&self) -> bool {
        self.held_info().is_some()
    }

    /// Info about the currently held port.
    pub async fn device_info(&self) -> Option<SerialDeviceInfo> {
        self.held_info()
    }

    fn held_info(&self) -> Option<SerialDeviceInfo> {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_held(&self, info: Option<SerialDeviceInfo>) {
        *self.held.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }

    /// Request a port from the provider and open it.
    ///
    /// Does not check that the firmware answers; use [`ping`](Self::ping) for that.
    /// An already open port is closed before the new one is opened, so a
    /// failed `request_port` leaves the current connection alone but a failed
    /// `open_port` leaves the session closed.
    pub async fn open(&self, options: OpenOptions) -> Result<SerialDeviceInfo> {
        let info = self
            .provider
            .request_port(&options.filter)
            .await
            .map_err(SerialError::into_acquisition_error)?;

        if self.is_connected().await {
            log::info!("Replacing existing connection with {}", info.port_name);
            self.close().await;
        }

        let port = self
            .provider
            .open_port(&info, &options)
            .await
            .map_err(SerialError::into_acquisition_error)?;

        *self.connection.lock().await = Some(Connection { port, info: info.clone() });
        self.set_held(Some(info.clone()));
        *self.last_options.lock().unwrap_or_else(|e| e.into_inner()) = Some(options.clone());

        log::info!(
            "Connected to {} at {} baud",
            info.port_name,
            options.baud_rate
        );
        Ok(info)
    }

    /// Open using the port settings from this session's config.
    pub async fn open_default(&self) -> Result<SerialDeviceInfo> {
        self.open(self.config.port.clone()).await
    }

    /// Release the port. Cancels pending I/O; calling it when closed is a no-op.
    pub async fn close(&self) {
        self.closing.send_modify(|generation| *generation = generation.wrapping_add(1));
        let taken = {
            let mut guard = self.connection.lock().await;
            self.set_held(None);
            guard.take()
        };
        if let Some(mut conn) = taken {
            if let Err(e) = conn.port.shutdown().await {
                log::warn!("Error shutting down {}: {}", conn.info.port_name, e);
            }
            log::info!("Disconnected from {}", conn.info.port_name);
        }
    }

    /// Write raw data to the device.
    pub async fn write(&self, data: &str) -> Result<()> {
        let _busy = self.acquire().await?;
        self.write_locked(data.as_bytes()).await
    }

    /// Read until a newline arrives or `timeout` elapses.
    ///
    /// On timeout whatever was received so far is returned, possibly empty.
    pub async fn read(&self, timeout: Duration) -> Result<String> {
        let _busy = self.acquire().await?;
        self.read_locked(timeout).await
    }

    /// Send a command and return its payload with the status line stripped.
    ///
    /// If another exchange is in flight this waits `read_timeout` and tries
    /// again until the transport is free.
    pub async fn send_command(
        &self,
        command: &str,
        write_delay: Duration,
        read_timeout: Duration,
    ) -> Result<String> {
        let _busy = self.wait_until_idle(read_timeout).await;
        self.exchange(command, write_delay, read_timeout)
            .await
            .map_err(|e| SerialError::Command(Box::new(e)))
    }

    /// [`send_command`](Self::send_command) with the configured timing.
    pub async fn send_command_default(&self, command: &str) -> Result<String> {
        self.send_command(command, self.write_delay(), self.read_timeout())
            .await
    }

    /// Check the firmware answers `PING` using the configured retry budget.
    pub async fn ping(&self) -> Result<bool> {
        self.ping_with(
            self.config.ping_retries,
            Duration::from_millis(self.config.ping_retry_delay_ms),
        )
        .await
    }

    /// Retry `PING` until a `PONG` comes back.
    ///
    /// Boards that reset when the port opens print boot noise first, so
    /// unexpected responses are logged and retried rather than treated as errors.
    pub async fn ping_with(&self, max_retries: u32, retry_delay: Duration) -> Result<bool> {
        let ping_delay = Duration::from_millis(self.config.ping_write_delay_ms);
        for attempt in 1..=max_retries {
            let response = self
                .send_command(CMD_PING, ping_delay, self.read_timeout())
                .await?;
            if response.starts_with(PONG_PREFIX) {
                log::info!("Device answered PING (attempt {}/{})", attempt, max_retries);
                return Ok(true);
            }
            log::warn!(
                "Unexpected PING response '{}' (attempt {}/{})",
                response.trim_end(),
                attempt,
                max_retries
            );
            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        Err(SerialError::PingTimeout { attempts: max_retries })
    }

    pub fn add_listener<F>(&self, kind: SessionEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.listeners.add(kind, Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Async stream of session events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.listeners.subscribe()
    }

    /// React to a port appearing or disappearing at the OS level.
    pub async fn handle_hardware_event(&self, event: PortEvent) {
        match event {
            PortEvent::PortRemoved(info) => {
                let held = self.device_info().await;
                let relevant = match &held {
                    Some(current) => current.port_name == info.port_name,
                    None => self.watched_filter().matches(&info),
                };
                if !relevant {
                    log::debug!("Ignoring removal of unrelated port {}", info.port_name);
                    return;
                }
                if held.is_some() {
                    log::warn!("Device on {} was physically disconnected", info.port_name);
                    self.close().await;
                }
                self.listeners.emit(SessionEvent::Disconnected {
                    port_name: held.map(|h| h.port_name),
                });
            }
            PortEvent::PortAdded(info) => {
                if !self.watched_filter().matches(&info) {
                    log::debug!("Ignoring unrelated port {}", info.port_name);
                    return;
                }
                let reopened = self.try_reacquire().await;
                self.listeners.emit(SessionEvent::Connected {
                    port_name: info.port_name,
                    reopened,
                });
            }
        }
    }

    /// Feed events from a port monitor into [`handle_hardware_event`](Self::handle_hardware_event).
    ///
    /// The task ends when the channel closes or the session is dropped.
    pub fn spawn_hardware_watch(self: &Arc<Self>, mut events: mpsc::Receiver<PortEvent>) -> JoinHandle<()> {
        let session: Weak<DeviceSession> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_hardware_event(event).await;
            }
            log::debug!("Hardware event watch stopped");
        })
    }

    fn watched_filter(&self) -> super::PortFilter {
        self.last_options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|o| o.filter.clone())
            .unwrap_or_else(|| self.config.port.filter.clone())
    }

    // Best effort: failure here is expected when the new port isn't ours
    async fn try_reacquire(&self) -> bool {
        if self.is_connected().await {
            return false;
        }
        let options = self
            .last_options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(options) = options else {
            return false;
        };
        match self.open(options).await {
            Ok(info) => {
                log::info!("Re-acquired {}", info.port_name);
                true
            }
            Err(e) => {
                log::debug!("Automatic re-acquisition failed: {}", e);
                false
            }
        }
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.busy
            .acquire()
            .await
            .map_err(|_| SerialError::TransportUnavailable)
    }

    async fn wait_until_idle(&self, retry_after: Duration) -> SemaphorePermit<'_> {
        loop {
            match self.busy.try_acquire() {
                Ok(permit) => return permit,
                Err(_) => {
                    log::debug!("Session busy, retrying in {:?}", retry_after);
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    async fn exchange(&self, command: &str, write_delay: Duration, read_timeout: Duration) -> Result<String> {
        self.discard_stale_locked().await?;
        log::debug!("-> {}", command);
        self.write_locked(format!("{}\n", command).as_bytes()).await?;
        tokio::time::sleep(write_delay).await;
        let response = self.read_locked(read_timeout).await?;
        log::debug!("<- {:?}", response);
        split_status_line(&response, &self.config.product_tag)
    }

    async fn write_locked(&self, data: &[u8]) -> Result<()> {
        let mut close_rx = self.closing.subscribe();
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(SerialError::TransportUnavailable)?;
        if close_rx.has_changed().unwrap_or(true) {
            return Err(SerialError::StreamClosed);
        }

        let port = &mut conn.port;
        tokio::select! {
            biased;
            _ = close_rx.changed() => Err(SerialError::StreamClosed),
            res = async {
                port.write_all(data).await?;
                port.flush().await?;
                Ok::<_, std::io::Error>(())
            } => res.map_err(SerialError::IoError),
        }
    }

    /// Drop bytes left over from an earlier exchange so they can't be taken
    /// for this command's response.
    async fn discard_stale_locked(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(SerialError::TransportUnavailable)?;
        let mut stale = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        // A zero timeout still polls the read once, so only data already buffered is taken
        while let Ok(res) = tokio::time::timeout(Duration::ZERO, conn.port.read(&mut chunk)).await {
            match res {
                Ok(0) => break,
                Ok(n) => stale.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(SerialError::IoError(e)),
            }
        }
        if !stale.is_empty() {
            log::warn!(
                "Discarding {} stale byte(s) before command: {:?}",
                stale.len(),
                String::from_utf8_lossy(&stale)
            );
        }
        Ok(())
    }

    async fn read_locked(&self, timeout: Duration) -> Result<String> {
        let mut close_rx = self.closing.subscribe();
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(SerialError::TransportUnavailable)?;
        if close_rx.has_changed().unwrap_or(true) {
            return Err(SerialError::StreamClosed);
        }

        let deadline = Instant::now() + timeout;
        let mut raw = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                biased;
                _ = close_rx.changed() => return Err(SerialError::StreamClosed),
                res = tokio::time::timeout_at(deadline, conn.port.read(&mut chunk)) => match res {
                    Err(_elapsed) => {
                        log::debug!("Read timed out after {:?} with {} byte(s)", timeout, raw.len());
                        break;
                    }
                    Ok(Ok(0)) => return Err(SerialError::StreamClosed),
                    Ok(Ok(n)) => {
                        raw.extend_from_slice(&chunk[..n]);
                        if chunk[..n].contains(&b'\n') {
                            break;
                        }
                    }
                    Ok(Err(e)) => return Err(SerialError::IoError(e)),
                },
            }
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}
