//! Channel wrapper that records how each transaction was resolved.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use bytes::Bytes;
use ferry_delivery::{Channel, DeliveryError, Event, MemoryChannel, Result, Transaction};

/// What happened inside one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Body of the event taken, if any.
    pub taken: Option<Bytes>,
    /// Number of commit calls.
    pub commits: usize,
    /// Number of rollback calls.
    pub rollbacks: usize,
}

impl TransactionRecord {
    /// Exactly one commit and no rollback.
    pub fn committed(&self) -> bool {
        self.commits == 1 && self.rollbacks == 0
    }

    /// Exactly one rollback and no commit.
    pub fn rolled_back(&self) -> bool {
        self.rollbacks == 1 && self.commits == 0
    }
}

/// [`MemoryChannel`] that logs every transaction and can inject failures.
#[derive(Clone)]
pub struct RecordingChannel {
    inner: MemoryChannel,
    log: Arc<Mutex<Vec<TransactionRecord>>>,
    failing_begins: Arc<AtomicUsize>,
}

impl RecordingChannel {
    /// Creates a channel holding `events`.
    ///
    /// # Panics
    ///
    /// Panics if there are more events than the channel holds.
    pub fn with_events<I, B>(events: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let channel = Self::new(1024);
        for body in events {
            channel.inner.put(Event::new(body)).expect("recording channel over capacity");
        }
        channel
    }

    /// Creates an empty channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: MemoryChannel::new(capacity),
            log: Arc::new(Mutex::new(Vec::new())),
            failing_begins: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Appends an event.
    pub fn put(&self, event: Event) -> Result<()> {
        self.inner.put(event)
    }

    /// Events still waiting.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Makes the next `count` calls to `begin` fail with a channel error.
    pub fn fail_next_begins(&self, count: usize) {
        self.failing_begins.store(count, Ordering::SeqCst);
    }

    /// Every transaction opened so far, in order.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.lock().clone()
    }

    /// Transactions that actually took an event.
    pub fn taking_transactions(&self) -> Vec<TransactionRecord> {
        self.lock().iter().filter(|record| record.taken.is_some()).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransactionRecord>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel for RecordingChannel {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let failing = self
            .failing_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeliveryError::channel("injected begin failure"));
        }

        let inner = self.inner.begin()?;
        let index = {
            let mut log = self.lock();
            log.push(TransactionRecord::default());
            log.len() - 1
        };
        Ok(Box::new(RecordingTransaction { inner, channel: self, index }))
    }
}

struct RecordingTransaction<'a> {
    inner: Box<dyn Transaction + 'a>,
    channel: &'a RecordingChannel,
    index: usize,
}

impl RecordingTransaction<'_> {
    fn record(&self, update: impl FnOnce(&mut TransactionRecord)) {
        if let Some(record) = self.channel.lock().get_mut(self.index) {
            update(record);
        }
    }
}

impl Transaction for RecordingTransaction<'_> {
    fn take(&mut self) -> Result<Option<Event>> {
        let event = self.inner.take()?;
        let body = event.as_ref().map(|event| event.body.clone());
        self.record(|record| record.taken = body);
        Ok(event)
    }

    fn commit(&mut self) -> Result<()> {
        self.record(|record| record.commits += 1);
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.record(|record| record.rollbacks += 1);
        self.inner.rollback()
    }
}

#[cfg(test)]
mod tests {
    use ferry_delivery::TransactionScope;

    use super::*;

    #[test]
    fn records_resolution_per_transaction() {
        let channel = RecordingChannel::with_events(["a", "b"]);

        let mut scope = TransactionScope::begin(&channel).unwrap();
        scope.take().unwrap();
        scope.commit().unwrap();

        let mut scope = TransactionScope::begin(&channel).unwrap();
        scope.take().unwrap();
        drop(scope);

        let records = channel.transactions();
        assert_eq!(records.len(), 2);
        assert!(records[0].committed());
        assert_eq!(records[0].taken, Some(Bytes::from("a")));
        assert!(records[1].rolled_back());
        assert_eq!(channel.len(), 1);
    }

    #[test]
    #[should_panic(expected = "over capacity")]
    fn seeding_past_capacity_panics() {
        RecordingChannel::with_events(vec!["x"; 1025]);
    }

    #[test]
    fn injected_begin_failures_are_consumed() {
        let channel = RecordingChannel::new(4);
        channel.fail_next_begins(1);

        assert!(TransactionScope::begin(&channel).is_err());
        assert!(TransactionScope::begin(&channel).is_ok());
    }
}
