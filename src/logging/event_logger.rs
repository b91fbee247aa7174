use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::Event;
use crate::server::storage_traits::EventStore;

/// Usage/audit event sink. Never blocks the caller.
pub trait EventLogger: Send + Sync {
    fn log_event(&self, event: Event);
}

/// Bounded queue drained by a background task into an [`EventStore`].
/// Events are dropped with a warning when the queue is full.
pub struct BufferedEventLogger {
    tx: mpsc::Sender<Event>,
}

impl BufferedEventLogger {
    pub fn spawn(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let name = event.name.as_str();
                if let Err(e) = store.store_event(event).await {
                    tracing::error!(event = name, error = %e, "failed to store event");
                }
            }
            tracing::debug!("event logger stopped");
        });
        Self { tx }
    }
}

impl EventLogger for BufferedEventLogger {
    fn log_event(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => {
                tracing::warn!(event = ev.name.as_str(), identifier = %ev.identifier, "event queue full, dropping event");
            }
            Err(TrySendError::Closed(ev)) => {
                tracing::warn!(event = ev.name.as_str(), "event logger closed, dropping event");
            }
        }
    }
}
