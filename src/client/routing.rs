//! Correlation of in-flight requests with their reply channels.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::error::{Result, TransportError};
use crate::packet::{ResponseOutcome, ResponsePacket};

type ReplySender = mpsc::UnboundedSender<Result<Value>>;

/// What happened to a response handed to [`RoutingTable::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// More responses are expected for the id.
    Partial,
    /// Final response; the entry was removed.
    Completed,
    /// No waiting caller.
    Unroutable,
}

/// Pending request ids mapped to their reply channels.
///
/// Touched by callers registering requests and by the reply loop
/// completing them.
#[derive(Default)]
pub(crate) struct RoutingTable {
    pending: Mutex<HashMap<String, ReplySender>>,
}

impl RoutingTable {
    pub(crate) fn register(&self, id: &str) -> mpsc::UnboundedReceiver<Result<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.to_string(), tx);
        }
        rx
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.pending
            .lock()
            .map(|mut pending| pending.remove(id).is_some())
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Route a response to its caller.
    ///
    /// Errors are final even without `isDisposed`.
    pub(crate) fn deliver(&self, response: ResponsePacket) -> Delivery {
        let Ok(mut pending) = self.pending.lock() else {
            return Delivery::Unroutable;
        };
        let Some(tx) = pending.get(&response.id) else {
            return Delivery::Unroutable;
        };

        let failed = matches!(response.outcome, ResponseOutcome::Err(_));
        if failed && !response.is_disposed {
            warn!(id = %response.id, "Error response without isDisposed, completing request");
        }
        let last = failed || response.is_disposed;
        let id = response.id.clone();
        let delivered = tx.send(response.into_result()).is_ok();

        if last || !delivered {
            pending.remove(&id);
        }
        match (delivered, last) {
            (false, _) => Delivery::Unroutable,
            (true, true) => Delivery::Completed,
            (true, false) => Delivery::Partial,
        }
    }

    /// Fail and remove every pending request.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<ReplySender> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
            Err(_) => return 0,
        };
        for tx in &drained {
            let _ = tx.send(Err(TransportError::Closed));
        }
        drained.len()
    }
}

/// Responses to one request.
///
/// Yields every routed value until the final response, then ends. A failure
/// is yielded as an `Err` item and ends the stream. Dropping it abandons the
/// request: later responses for its id are ignored.
pub struct ReplyStream {
    id: String,
    inner: UnboundedReceiverStream<Result<Value>>,
    routing: Weak<RoutingTable>,
}

impl ReplyStream {
    pub(crate) fn new(
        id: String,
        rx: mpsc::UnboundedReceiver<Result<Value>>,
        routing: Weak<RoutingTable>,
    ) -> Self {
        Self {
            id,
            inner: UnboundedReceiverStream::new(rx),
            routing,
        }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the first response and decode it.
    pub async fn first<R: DeserializeOwned>(mut self) -> Result<R> {
        match self.next().await {
            Some(Ok(value)) => Ok(serde_json::from_value(value)?),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Closed),
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if let Some(routing) = self.routing.upgrade() {
            routing.remove(&self.id);
        }
    }
}
