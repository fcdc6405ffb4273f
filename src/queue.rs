//! Bounded concurrent FIFO.
//!
//! [`Queue`] is the backpressure primitive used for outbound, pending and
//! inbound messages. Capacity is either a message count or a byte amount;
//! [`Queue::push`] fails with [`QueueError::Full`] instead of blocking.
//!
//! The queue tracks the running total of its entries' sizes (as measured by
//! the amount function given at construction), so a transport can report its
//! buffered amount without walking the queue.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

use crate::message::Message;

// ============================================================================
// Types
// ============================================================================

/// Size function applied to each queued entry.
pub type AmountFn<T> = fn(&T) -> usize;

/// Capacity policy of a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLimit {
    /// No capacity limit.
    Unbounded,
    /// At most this many entries.
    Messages(usize),
    /// At most this many bytes (as measured by the amount function).
    Bytes(usize),
}

impl QueueLimit {
    /// Numeric value of the limit, `usize::MAX` when unbounded.
    #[inline]
    #[must_use]
    pub const fn value(self) -> usize {
        match self {
            Self::Unbounded => usize::MAX,
            Self::Messages(n) | Self::Bytes(n) => n,
        }
    }
}

/// Queue operation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError<T> {
    /// Pushing would exceed the capacity; the entry is handed back.
    #[error("queue full")]
    Full(T),
    /// Nothing to pop.
    #[error("queue empty")]
    Empty,
}

struct QueueInner<T> {
    entries: VecDeque<T>,
    amount: usize,
}

// ============================================================================
// Queue
// ============================================================================

/// Bounded concurrent FIFO with byte accounting.
///
/// # Thread Safety
///
/// All operations take an internal lock and may be called concurrently from
/// the I/O thread and any caller thread.
pub struct Queue<T> {
    inner: Mutex<QueueInner<T>>,
    limit: QueueLimit,
    amount_fn: AmountFn<T>,
}

impl<T> Queue<T> {
    /// Creates a queue with the given limit and amount function.
    #[must_use]
    pub fn new(limit: QueueLimit, amount_fn: AmountFn<T>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                amount: 0,
            }),
            limit,
            amount_fn,
        }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] with the rejected entry when the limit
    /// would be exceeded. A byte-limited queue always accepts one entry when
    /// empty, so an oversized entry cannot wedge it forever.
    pub fn push(&self, entry: T) -> Result<(), QueueError<T>> {
        let size = (self.amount_fn)(&entry);
        let mut inner = self.inner.lock();

        let full = match self.limit {
            QueueLimit::Unbounded => false,
            QueueLimit::Messages(max) => inner.entries.len() >= max,
            QueueLimit::Bytes(max) => {
                !inner.entries.is_empty() && inner.amount.saturating_add(size) > max
            }
        };

        if full {
            return Err(QueueError::Full(entry));
        }

        inner.amount += size;
        inner.entries.push_back(entry);
        Ok(())
    }

    /// Removes and returns the oldest entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Empty`] when nothing is queued.
    pub fn pop(&self) -> Result<T, QueueError<T>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop_front().ok_or(QueueError::Empty)?;
        inner.amount -= (self.amount_fn)(&entry);
        Ok(entry)
    }

    /// Removes the oldest entry if `accept` approves it.
    ///
    /// The check and the removal happen under one lock, so the entry seen by
    /// `accept` is the entry returned. `Ok(None)` means the entry was
    /// rejected and stays queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Empty`] when nothing is queued.
    pub fn pop_if(&self, accept: impl FnOnce(&T) -> bool) -> Result<Option<T>, QueueError<T>> {
        let mut inner = self.inner.lock();
        let front = inner.entries.front().ok_or(QueueError::Empty)?;
        if !accept(front) {
            return Ok(None);
        }

        let entry = inner.entries.pop_front().ok_or(QueueError::Empty)?;
        inner.amount -= (self.amount_fn)(&entry);
        Ok(Some(entry))
    }

    /// Removes every entry and returns them oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.amount = 0;
        inner.entries.drain(..).collect()
    }

    /// Number of queued entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Sum of the sizes of all queued entries.
    #[inline]
    #[must_use]
    pub fn amount(&self) -> usize {
        self.inner.lock().amount
    }

    /// Configured capacity policy.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> QueueLimit {
        self.limit
    }
}

impl<T: Clone> Queue<T> {
    /// Returns a copy of the oldest entry without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().entries.front().cloned()
    }
}

impl Queue<Message> {
    /// Creates a message queue weighted by [`Message::size`].
    #[must_use]
    pub fn for_messages(limit: QueueLimit) -> Self {
        Self::new(limit, Message::size)
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("len", &inner.entries.len())
            .field("amount", &inner.amount)
            .field("limit", &self.limit)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    #[test]
    fn test_fifo_order() {
        let queue = Queue::for_messages(QueueLimit::Unbounded);
        queue.push(Message::text("a")).unwrap();
        queue.push(Message::text("b")).unwrap();
        assert_eq!(&queue.pop().unwrap().payload[..], b"a");
        assert_eq!(&queue.pop().unwrap().payload[..], b"b");
        assert!(matches!(queue.pop(), Err(QueueError::Empty)));
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let queue = Queue::for_messages(QueueLimit::Unbounded);
        assert!(queue.peek().is_none());
        queue.push(Message::binary(vec![1u8, 2])).unwrap();
        assert_eq!(queue.peek().unwrap().len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.amount(), 2);
    }

    #[test]
    fn test_pop_if_keeps_rejected_entry() {
        let queue = Queue::for_messages(QueueLimit::Unbounded);
        assert!(matches!(queue.pop_if(|_| true), Err(QueueError::Empty)));

        queue.push(Message::binary(vec![0u8; 100])).unwrap();
        queue.push(Message::binary(vec![1u8])).unwrap();
        assert!(queue.pop_if(|m| m.len() <= 10).unwrap().is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.amount(), 101);

        let popped = queue.pop_if(|m| m.len() == 100).unwrap().unwrap();
        assert_eq!(popped.len(), 100);
        assert_eq!(queue.amount(), 1);
    }

    #[test]
    fn test_message_limit() {
        let queue = Queue::for_messages(QueueLimit::Messages(2));
        queue.push(Message::text("1")).unwrap();
        queue.push(Message::text("2")).unwrap();
        let rejected = queue.push(Message::text("3"));
        match rejected {
            Err(QueueError::Full(msg)) => assert_eq!(&msg.payload[..], b"3"),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_byte_limit() {
        let queue = Queue::for_messages(QueueLimit::Bytes(10));
        queue.push(Message::binary(vec![0u8; 6])).unwrap();
        assert!(queue.push(Message::binary(vec![0u8; 5])).is_err());
        queue.push(Message::binary(vec![0u8; 4])).unwrap();
        assert_eq!(queue.amount(), 10);
    }

    #[test]
    fn test_byte_limit_accepts_oversized_when_empty() {
        let queue = Queue::for_messages(QueueLimit::Bytes(4));
        queue.push(Message::binary(vec![0u8; 16])).unwrap();
        assert!(queue.push(Message::binary(vec![0u8; 1])).is_err());
    }

    #[test]
    fn test_control_messages_weigh_zero() {
        let queue = Queue::for_messages(QueueLimit::Unbounded);
        queue.push(Message::control(vec![3u8, 232])).unwrap();
        assert_eq!(queue.amount(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_resets_amount() {
        let queue = Queue::for_messages(QueueLimit::Unbounded);
        queue.push(Message::text("abc")).unwrap();
        queue.push(Message::text("de")).unwrap();
        assert_eq!(queue.drain().len(), 2);
        assert_eq!(queue.amount(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_push_pop() {
        let queue = Arc::new(Queue::for_messages(QueueLimit::Unbounded));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..250 {
                        queue.push(Message::binary(vec![0u8; 3])).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.amount(), 3000);

        let mut popped = 0;
        while queue.pop().is_ok() {
            popped += 1;
        }
        assert_eq!(popped, 1000);
        assert_eq!(queue.amount(), 0);
    }

    proptest! {
        #[test]
        fn prop_amount_is_sum_of_queued_sizes(
            ops in proptest::collection::vec((any::<bool>(), 0usize..64), 0..200)
        ) {
            let queue = Queue::for_messages(QueueLimit::Bytes(512));
            let mut model: std::collections::VecDeque<usize> = Default::default();

            for (is_push, size) in ops {
                if is_push {
                    if queue.push(Message::binary(vec![0u8; size])).is_ok() {
                        model.push_back(size);
                    }
                } else if let Ok(msg) = queue.pop() {
                    prop_assert_eq!(Some(msg.len()), model.pop_front());
                }
                prop_assert_eq!(queue.amount(), model.iter().sum::<usize>());
                prop_assert_eq!(queue.is_empty(), model.is_empty());
            }
        }
    }
}
