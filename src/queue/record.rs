//! Bounded queue of discrete records (events, spikes).

use crate::error::{RecordError, RecordResult};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::time::{Duration, Instant};

/// Real-time half of a record queue.
pub struct RecordProducer<T> {
    inner: HeapProducer<T>,
    name: &'static str,
}

/// Writer-thread half of a record queue.
pub struct RecordConsumer<T> {
    inner: HeapConsumer<T>,
}

/// Build a queue holding at most `capacity` records. `name` labels overflow errors.
pub fn record_queue<T>(capacity: usize, name: &'static str) -> (RecordProducer<T>, RecordConsumer<T>) {
    let (inner, out) = HeapRb::<T>::new(capacity.max(1)).split();
    (RecordProducer { inner, name }, RecordConsumer { inner: out })
}

impl<T> RecordProducer<T> {
    /// Queue one record; on overflow the record is dropped.
    #[inline]
    pub fn write(&mut self, record: T) -> RecordResult<()> {
        self.try_write(record)
            .map_err(|_| RecordError::QueueFull { queue: self.name })
    }

    /// Queue one record; on overflow the record is handed back.
    #[inline]
    pub fn try_write(&mut self, record: T) -> Result<(), T> {
        self.inner.push(record)
    }

    /// Records that still fit.
    pub fn free_len(&self) -> usize {
        self.inner.free_len()
    }

    /// Capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl<T> RecordConsumer<T> {
    /// Pop the oldest record.
    pub fn read(&mut self) -> Option<T> {
        self.inner.pop()
    }

    /// Pop the oldest record, waiting up to `timeout` for one.
    pub fn read_timeout(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.inner.pop() {
                return Some(record);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::park_timeout((deadline - now).min(Duration::from_millis(1)));
        }
    }

    /// Records waiting.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Discard everything queued. Returns the records dropped.
    pub fn reset(&mut self) -> usize {
        self.inner.clear()
    }
}
