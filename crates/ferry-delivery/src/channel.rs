//! Upstream channel abstraction and the scoped take/commit/rollback protocol.
//!
//! A [`Channel`] hands out [`Transaction`]s. The sink never drives a
//! transaction directly: it opens a [`TransactionScope`], which guarantees
//! that exactly one of commit or rollback runs on every exit path. Dropping a
//! scope that was neither committed nor rolled back rolls it back, so an early
//! return, a panic in the transport, or a cancelled future all leave the
//! unit of work in the channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// One unit of work: an opaque payload plus optional string headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// Event metadata.
    pub headers: HashMap<String, String>,
    /// Raw payload, sent unmodified as the request body.
    pub body: Bytes,
}

impl Event {
    /// Creates an event with no headers.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { headers: HashMap::new(), body: body.into() }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// One open transaction against a channel.
///
/// Implementations may assume a single caller: no other operation interleaves
/// between `take` and the matching `commit` or `rollback`.
pub trait Transaction: Send {
    /// Removes the next event, or returns `None` when the channel is empty.
    fn take(&mut self) -> Result<Option<Event>>;

    /// Permanently removes whatever was taken.
    fn commit(&mut self) -> Result<()>;

    /// Returns whatever was taken to the channel.
    fn rollback(&mut self) -> Result<()>;
}

/// Source of units of work.
pub trait Channel: Send + Sync {
    /// Opens a new transaction.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>>;
}

/// Scoped acquisition around a [`Transaction`].
///
/// `commit` and `rollback` consume the scope, so the type system rules out
/// calling both. Drop rolls back if neither was called.
pub struct TransactionScope<'a> {
    transaction: Option<Box<dyn Transaction + 'a>>,
}

impl<'a> TransactionScope<'a> {
    /// Opens a transaction on `channel`.
    ///
    /// # Errors
    ///
    /// Returns the channel's error if no transaction could be opened.
    pub fn begin(channel: &'a dyn Channel) -> Result<Self> {
        let transaction = channel.begin()?;
        Ok(Self { transaction: Some(transaction) })
    }

    /// Takes one event from the channel.
    ///
    /// # Errors
    ///
    /// Returns the channel's error; the scope still rolls back on drop.
    pub fn take(&mut self) -> Result<Option<Event>> {
        self.open()?.take()
    }

    /// Commits and closes the scope.
    ///
    /// # Errors
    ///
    /// Returns the channel's error. Rollback is not attempted afterwards.
    pub fn commit(mut self) -> Result<()> {
        match self.transaction.take() {
            Some(mut transaction) => transaction.commit(),
            None => Err(closed()),
        }
    }

    /// Rolls back and closes the scope.
    ///
    /// # Errors
    ///
    /// Returns the channel's error.
    pub fn rollback(mut self) -> Result<()> {
        match self.transaction.take() {
            Some(mut transaction) => transaction.rollback(),
            None => Err(closed()),
        }
    }

    fn open(&mut self) -> Result<&mut (dyn Transaction + 'a)> {
        self.transaction.as_deref_mut().ok_or_else(closed)
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if let Some(mut transaction) = self.transaction.take() {
            debug!("transaction scope dropped unresolved, rolling back");
            if let Err(error) = transaction.rollback() {
                warn!(error = %error, "rollback on drop failed");
            }
        }
    }
}

fn closed() -> DeliveryError {
    DeliveryError::channel("transaction already closed")
}

/// Bounded in-memory FIFO channel.
///
/// Cloning shares the underlying queue. A rolled back event goes back to the
/// head of the queue so the next take sees the same bytes.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    queue: Arc<Mutex<VecDeque<Event>>>,
    capacity: usize,
}

impl MemoryChannel {
    /// Creates an empty channel holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self { queue: Arc::new(Mutex::new(VecDeque::new())), capacity }
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Channel` when the channel is full.
    pub fn put(&self, event: Event) -> Result<()> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(DeliveryError::channel(format!(
                "channel full ({} events)",
                self.capacity
            )));
        }
        queue.push_back(event);
        Ok(())
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of events held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel for MemoryChannel {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        Ok(Box::new(MemoryTransaction { channel: self, taken: None }))
    }
}

struct MemoryTransaction<'a> {
    channel: &'a MemoryChannel,
    taken: Option<Event>,
}

impl Transaction for MemoryTransaction<'_> {
    fn take(&mut self) -> Result<Option<Event>> {
        if self.taken.is_some() {
            return Err(DeliveryError::channel("only one take per transaction"));
        }
        let event = self.channel.lock().pop_front();
        self.taken.clone_from(&event);
        Ok(event)
    }

    fn commit(&mut self) -> Result<()> {
        self.taken = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(event) = self.taken.take() {
            self.channel.lock().push_front(event);
        }
        Ok(())
    }
}
