//! Ledger notifications: events, envelopes and the pub/sub bus.
//!
//! The ledger never sends notifications itself. It publishes facts about
//! completed transfers and maintenance runs; the notification system (and any
//! other consumer) subscribes and composes outbound messages.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
