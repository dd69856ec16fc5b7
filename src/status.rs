//! Connection-state events.
//!
//! Client and server both report their store connection lifecycle through a
//! [`StatusListeners`] registry, so the surrounding framework can observe
//! `connect`, `ready`, `reconnecting`, `end` and `error` transitions.

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::debug;

/// Connection lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection attempt started.
    Connect,
    /// Connection established and usable.
    Ready,
    /// A read failed; the loop will retry after its retry delay.
    Reconnecting,
    /// Connection released by `close()`.
    End,
    /// Store error observed.
    Error(String),
}

/// Discriminant of [`ConnectionEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Connect,
    Ready,
    Reconnecting,
    End,
    Error,
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Connect => ConnectionEventKind::Connect,
            ConnectionEvent::Ready => ConnectionEventKind::Ready,
            ConnectionEvent::Reconnecting => ConnectionEventKind::Reconnecting,
            ConnectionEvent::End => ConnectionEventKind::End,
            ConnectionEvent::Error(_) => ConnectionEventKind::Error,
        }
    }
}

impl fmt::Display for ConnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionEventKind::Connect => "connect",
            ConnectionEventKind::Ready => "ready",
            ConnectionEventKind::Reconnecting => "reconnecting",
            ConnectionEventKind::End => "end",
            ConnectionEventKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Callback invoked for a connection event.
pub type StatusCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Registered connection-state listeners.
#[derive(Default)]
pub struct StatusListeners {
    listeners: RwLock<Vec<(ConnectionEventKind, StatusCallback)>>,
}

impl StatusListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind`.
    pub fn on<F>(&self, kind: ConnectionEventKind, callback: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((kind, Arc::new(callback)));
        }
    }

    /// Notify listeners registered for the event's kind.
    ///
    /// Callbacks run outside the registry lock, so they may register further
    /// listeners.
    pub fn emit(&self, event: ConnectionEvent) {
        let kind = event.kind();
        let matching: Vec<StatusCallback> = match self.listeners.read() {
            Ok(listeners) => listeners
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, cb)| Arc::clone(cb))
                .collect(),
            Err(_) => return,
        };

        debug!(event = %kind, listeners = matching.len(), "Connection event");

        for callback in matching {
            callback(&event);
        }
    }
}
