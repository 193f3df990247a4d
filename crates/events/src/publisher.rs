//! Outbound event publishing.
//!
//! Services publish only after the write that produced an event has been accepted
//! by storage. Delivery is at-least-once: consumers must tolerate duplicates.

use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Receiving end of an in-memory subscription.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Event-publishing collaborator.
///
/// Implementations must be shareable across threads. A publish failure is reported
/// to the caller; whether it is fatal is the caller's decision.
pub trait EventPublisher<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;
}

impl<M, P> EventPublisher<M> for Arc<P>
where
    P: EventPublisher<M> + ?Sized,
{
    type Error = P::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher lock poisoned")]
    Poisoned,
}

/// In-memory publisher for tests and single-process deployments.
///
/// Fans every message out to live subscribers and keeps a journal of everything
/// published so far.
#[derive(Debug)]
pub struct InMemoryEventPublisher<M> {
    subscribers: Mutex<Vec<Sender<M>>>,
    journal: Mutex<Vec<M>>,
}

impl<M> Default for InMemoryEventPublisher<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
        }
    }
}

impl<M: Clone> InMemoryEventPublisher<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // A poisoned lock leaves the subscription detached rather than failing the caller.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription::new(rx)
    }

    /// Snapshot of every message published so far, in publish order.
    pub fn published(&self) -> Vec<M> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.journal.lock().map(|journal| journal.len()).unwrap_or(0)
    }
}

impl<M> EventPublisher<M> for InMemoryEventPublisher<M>
where
    M: Clone + Send + 'static,
{
    type Error = PublishError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        {
            let mut subs = self.subscribers.lock().map_err(|_| PublishError::Poisoned)?;
            // Dead subscribers are dropped while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }
        self.journal
            .lock()
            .map_err(|_| PublishError::Poisoned)?
            .push(message);
        Ok(())
    }
}
