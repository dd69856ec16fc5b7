//! Connection bookkeeping shared by client and server.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{Result, TransportError};
use crate::status::{ConnectionEvent, StatusListeners};
use crate::store::{Connector, LogStore};

/// The command connection, readable without awaiting.
#[derive(Default)]
pub(crate) struct ConnectionSlot {
    inner: RwLock<Option<Arc<dyn LogStore>>>,
}

impl ConnectionSlot {
    /// Current connection, or `NotInitialized` before `connect()`.
    pub(crate) fn get(&self) -> Result<Arc<dyn LogStore>> {
        self.inner
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(TransportError::NotInitialized)
    }

    pub(crate) fn is_set(&self) -> bool {
        self.inner.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub(crate) fn set(&self, store: Arc<dyn LogStore>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = Some(store);
        }
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn LogStore>> {
        self.inner.write().ok().and_then(|mut slot| slot.take())
    }
}

/// Open a connection, reporting `connect` and failures to listeners.
pub(crate) async fn open(
    connector: &dyn Connector,
    status: &StatusListeners,
) -> Result<Arc<dyn LogStore>> {
    status.emit(ConnectionEvent::Connect);
    match connector.connect().await {
        Ok(store) => {
            info!(endpoint = %connector.describe(), "Store connection opened");
            Ok(store)
        }
        Err(e) => {
            error!(endpoint = %connector.describe(), error = %e, "Store connection failed");
            status.emit(ConnectionEvent::Error(e.to_string()));
            Err(e)
        }
    }
}

/// Report a failed loop read and wait before the next attempt.
pub(crate) async fn pause_after_read_error(
    err: &TransportError,
    status: &StatusListeners,
    retry_delay: Duration,
    stream: &str,
) {
    warn!(
        stream = %stream,
        error = %err,
        retry_delay_ms = retry_delay.as_millis() as u64,
        "Stream read failed, retrying"
    );
    status.emit(ConnectionEvent::Error(err.to_string()));
    status.emit(ConnectionEvent::Reconnecting);
    tokio::time::sleep(retry_delay).await;
}

/// Release a connection, logging instead of failing.
pub(crate) async fn release(store: &dyn LogStore) {
    if let Err(e) = store.quit().await {
        warn!(error = %e, "Failed to release store connection");
    }
}
