//! In-process change notifications.
//!
//! State owners (cargo ledger, connection broker) publish small messages and
//! status consumers subscribe to them. A subscriber sees every message sent
//! after it subscribed; senders whose receiver is gone are dropped on the
//! next publish.

use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InMemoryBusError {
    #[error("subscriber list lock poisoned")]
    Poisoned,
}

/// Receiving half handed out by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription<M> {
    rx: Receiver<M>,
}

impl<M> Subscription<M> {
    /// Blocks; fails once the bus itself has been dropped.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.rx.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&self) -> Vec<M> {
        self.rx.try_iter().collect()
    }
}

pub trait EventBus<M>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns how many subscribers the message reached.
    fn publish(&self, message: M) -> Result<usize, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B: EventBus<M> + ?Sized> EventBus<M> for Arc<B> {
    type Error = <B as EventBus<M>>::Error;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        <B as EventBus<M>>::publish(self, message)
    }

    fn subscribe(&self) -> Subscription<M> {
        <B as EventBus<M>>::subscribe(self)
    }
}

/// Fan-out over one std channel per subscriber.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    senders: Mutex<Vec<Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send> EventBus<M> for InMemoryEventBus<M> {
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        let mut senders = self.senders.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(senders.len())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // A poisoned list still accepts new senders; publish reports the poison.
        match self.senders.lock() {
            Ok(mut senders) => senders.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        Subscription { rx }
    }
}
