//! Connect/disconnect notifications for a [`DeviceSession`](super::DeviceSession).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEventKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Hardware reported a matching port appeared; `reopened` tells whether
    /// the session managed to re-acquire it.
    Connected { port_name: String, reopened: bool },
    /// The held port went away and the session was torn down.
    Disconnected { port_name: Option<String> },
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Connected { .. } => SessionEventKind::Connect,
            SessionEvent::Disconnected { .. } => SessionEventKind::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Callback registry keyed by event kind, with a broadcast fan-out for async consumers.
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<SessionEventKind, Vec<(ListenerId, Listener)>>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(capacity);
        Self {
            listeners: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn add(&self, kind: SessionEventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(kind).or_default().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for entries in guard.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn count(&self, kind: SessionEventKind) -> usize {
        let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: SessionEvent) {
        // Snapshot so callbacks may add or remove listeners without deadlocking
        let targets: Vec<Listener> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        log::debug!("Dispatching {:?} to {} listener(s)", event, targets.len());
        for listener in targets {
            listener(&event);
        }
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(16)
    }
}
