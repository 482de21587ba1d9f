//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes ledger events to consumers after the ledger has
//! committed the corresponding writes. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels in tests, a broker in production
//! - **At-least-once delivery**: consumers must be idempotent (dedupe on `event_id`)
//! - **No persistence**: the Transfer Ledger is the source of truth, not the bus

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Intended for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Publication failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,

    /// Transport-level failure (broker unreachable, buffer full, ...).
    #[error("event bus transport error: {0}")]
    Transport(String),
}

/// Pub/sub abstraction for ledger events.
///
/// ```text
/// Ownership Transfer Service → Transfer Ledger (append) → EventBus (publish) → Consumers
///                                                                               ├─ Notifications
///                                                                               └─ Dashboards
/// ```
///
/// `publish()` may fail; callers in the ledger treat publication as best effort
/// because the committed Transfer Record already exists.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
