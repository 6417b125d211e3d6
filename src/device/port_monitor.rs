use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::serial::{NativeTransport, Result, SerialDeviceInfo, SerialError};

/// Events emitted by the port monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A serial port was added
    PortAdded(SerialDeviceInfo),
    /// A serial port was removed
    PortRemoved(SerialDeviceInfo),
}

impl PortEvent {
    pub fn port_name(&self) -> &str {
        match self {
            PortEvent::PortAdded(info) | PortEvent::PortRemoved(info) => &info.port_name,
        }
    }
}

/// Source of OS-level serial port add/remove notifications
#[async_trait::async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> Result<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> Result<()>;

    /// Get receiver for port events; only the first call returns it
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Drops repeats of the same event for the same port inside the debounce window
pub struct PortEventDebouncer {
    tx: mpsc::Sender<PortEvent>,
    last_sent: HashMap<(String, bool), Instant>,
    debounce_duration: Duration,
}

impl PortEventDebouncer {
    pub fn new(tx: mpsc::Sender<PortEvent>, debounce_ms: u64) -> Self {
        Self {
            tx,
            last_sent: HashMap::new(),
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    pub async fn send_event(&mut self, event: PortEvent) -> std::result::Result<(), mpsc::error::SendError<PortEvent>> {
        let key = (event.port_name().to_string(), matches!(event, PortEvent::PortAdded(_)));
        let now = Instant::now();
        if let Some(last) = self.last_sent.get(&key) {
            if now.duration_since(*last) < self.debounce_duration {
                log::debug!("Port event debounced: {:?}", event);
                return Ok(());
            }
        }
        self.last_sent.insert(key, now);
        self.tx.send(event).await
    }
}

/// Compare two port snapshots; removals are reported before additions.
pub fn diff_ports(
    previous: &HashMap<String, SerialDeviceInfo>,
    current: &HashMap<String, SerialDeviceInfo>,
) -> Vec<PortEvent> {
    let mut removed: Vec<PortEvent> = previous
        .iter()
        .filter(|(name, _)| !current.contains_key(*name))
        .map(|(_, info)| PortEvent::PortRemoved(info.clone()))
        .collect();
    let mut added: Vec<PortEvent> = current
        .iter()
        .filter(|(name, _)| !previous.contains_key(*name))
        .map(|(_, info)| PortEvent::PortAdded(info.clone()))
        .collect();
    removed.sort_by(|a, b| a.port_name().cmp(b.port_name()));
    added.sort_by(|a, b| a.port_name().cmp(b.port_name()));
    removed.extend(added);
    removed
}

pub type PortLister = Arc<dyn Fn() -> Result<Vec<SerialDeviceInfo>> + Send + Sync>;

/// Portable monitor that polls the port list and reports the differences
pub struct PollingPortMonitor {
    lister: PortLister,
    poll_interval: Duration,
    debounce_ms: u64,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_lister(poll_interval, Arc::new(NativeTransport::list_ports))
    }

    pub fn with_lister(poll_interval: Duration, lister: PortLister) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            lister,
            poll_interval,
            debounce_ms: 100,
            tx: Some(tx),
            rx: Some(rx),
            stop_tx: None,
            task_handle: None,
        }
    }

    async fn snapshot(lister: &PortLister) -> Option<HashMap<String, SerialDeviceInfo>> {
        let lister = lister.clone();
        match tokio::task::spawn_blocking(move || lister()).await {
            Ok(Ok(ports)) => Some(ports.into_iter().map(|p| (p.port_name.clone(), p)).collect()),
            Ok(Err(e)) => {
                log::warn!("Failed to enumerate serial ports: {}", e);
                None
            }
            Err(e) => {
                log::error!("Port enumeration task failed: {}", e);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(SerialError::MonitorAlreadyStarted)?;
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let lister = self.lister.clone();
        let poll_interval = self.poll_interval;
        let mut debouncer = PortEventDebouncer::new(tx, self.debounce_ms);
        // Ports present at start are the baseline, not events
        let mut known = Self::snapshot(&lister).await.unwrap_or_default();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        log::info!("Port monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(current) = Self::snapshot(&lister).await else {
                            continue;
                        };
                        for event in diff_ports(&known, &current) {
                            log::debug!("Port event: {:?}", event);
                            if let Err(e) = debouncer.send_event(event).await {
                                log::error!("Failed to send port event: {}", e);
                                return;
                            }
                        }
                        known = current;
                    }
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                log::warn!("Port monitor task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
