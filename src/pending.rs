//! Non-blocking handles for work the host runs asynchronously.
//!
//! The tick loop never awaits: camera acquisition, detector model creation
//! and asset loads all resolve on their own, and a tick that observes an
//! in-flight task treats the resource as temporarily unavailable. `Pending`
//! wraps a oneshot receiver so each tick can poll for the result without
//! suspending.

use tokio::sync::oneshot;

/// Outcome of polling a [`Pending`] handle.
#[derive(Debug)]
pub enum PendingPoll<T> {
    /// The task has not resolved yet.
    InFlight,
    /// The task resolved; the value is handed over exactly once.
    Resolved(T),
    /// The producer was dropped without resolving. Callers treat this the
    /// same as a failed resolution.
    Dropped,
}

/// A resource that resolves at some later tick.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Create a pending handle together with its resolver.
    pub fn channel() -> (oneshot::Sender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that resolves on the very next poll. Useful for hosts whose
    /// resources are available synchronously.
    pub fn resolved(value: T) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(value);
        pending
    }

    /// Check for the result without blocking.
    pub fn poll(&mut self) -> PendingPoll<T> {
        match self.rx.try_recv() {
            Ok(value) => PendingPoll::Resolved(value),
            Err(oneshot::error::TryRecvError::Empty) => PendingPoll::InFlight,
            Err(oneshot::error::TryRecvError::Closed) => PendingPoll::Dropped,
        }
    }
}
