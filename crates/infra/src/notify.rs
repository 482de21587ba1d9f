//! Best-effort publication of ledger events for the notification system.

use std::sync::Arc;

use tracing::warn;

use equiptrack_events::{EventBus, EventEnvelope};
use equiptrack_inventory::LedgerEvent;

pub type LedgerEnvelope = EventEnvelope<LedgerEvent>;

/// Publishes after the ledger write has committed. A failed publish is logged
/// and never fails the operation that produced the event.
#[derive(Clone, Default)]
pub struct Notifier {
    bus: Option<Arc<dyn EventBus<LedgerEnvelope>>>,
}

impl Notifier {
    pub fn new(bus: Arc<dyn EventBus<LedgerEnvelope>>) -> Self {
        Self { bus: Some(bus) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: LedgerEvent) {
        let Some(bus) = &self.bus else {
            return;
        };
        let envelope = EventEnvelope::wrap(event);
        let event_type = envelope.event_type().to_string();
        if let Err(err) = bus.publish(envelope) {
            warn!(event_type = %event_type, error = %err, "ledger notification dropped");
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.bus.is_some())
            .finish()
    }
}
