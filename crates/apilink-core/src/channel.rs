use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::LinkEvent;

/// Broadcast event stream type used by collaborators.
pub type EventStream = broadcast::Receiver<LinkEvent>;

/// Errors returned while reading from an event stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    /// Every sender has been dropped.
    #[error("event bus is closed")]
    Closed,
    /// The subscriber fell behind and missed events.
    #[error("subscriber lagged and skipped {0} events")]
    Lagged(u64),
}

/// Process-wide publish/subscribe channel for [`LinkEvent`]s.
///
/// Cloning the bus clones the sending half; every clone publishes to the same
/// set of subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
    event_tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; having no subscribers is not an error.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Await the next event, mapping broadcast errors to [`EventBusError`].
pub async fn next_event(stream: &mut EventStream) -> Result<LinkEvent, EventBusError> {
    stream.recv().await.map_err(|err| match err {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(skipped) => EventBusError::Lagged(skipped),
    })
}

/// Drain every event currently buffered for `stream` without waiting.
pub fn drain_events(stream: &mut EventStream) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    loop {
        match stream.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
