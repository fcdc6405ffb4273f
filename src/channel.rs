//! Callback and inbound-queue half of a connection.
//!
//! [`ChannelCore`] owns the user callbacks and the inbound message queue.
//! Every event is delivered on the connection's [`Processor`], so callbacks
//! of one connection never run concurrently and keep their order: open
//! before any message, error before closed.
//!
//! Open, closed and error events are stored when no callback is registered
//! yet, and delivered as soon as one is.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::message::{Message, MessageData, MessageKind};
use crate::queue::{Queue, QueueError, QueueLimit};
use crate::runtime::Processor;

// ============================================================================
// Constants
// ============================================================================

/// Inbound messages kept before new ones are dropped.
pub const RECV_QUEUE_LIMIT: usize = 1024;

// ============================================================================
// Callback Types
// ============================================================================

/// Called once the connection is open.
pub type OpenCallback = Arc<dyn Fn() + Send + Sync>;

/// Called once the connection is closed.
pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// Called with a description of a connection failure.
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Called with each inbound message. Registering it consumes the queue.
pub type MessageCallback = Arc<dyn Fn(MessageData) + Send + Sync>;

/// Called with the inbound queue length when messages become available.
pub type AvailableCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Called when the buffered amount falls to or below the threshold.
pub type BufferedAmountLowCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    open: Option<OpenCallback>,
    closed: Option<ClosedCallback>,
    error: Option<ErrorCallback>,
    message: Option<MessageCallback>,
    available: Option<AvailableCallback>,
    buffered_amount_low: Option<BufferedAmountLowCallback>,

    // Events fired while their callback was missing.
    stored_open: bool,
    stored_closed: bool,
    stored_errors: Vec<String>,
}

// ============================================================================
// ChannelCore
// ============================================================================

/// User callbacks, ordered event delivery and the inbound queue.
pub struct ChannelCore {
    processor: Processor,
    callbacks: Mutex<Callbacks>,
    inbound: Queue<Message>,
    buffered_amount: AtomicUsize,
    buffered_amount_low_threshold: AtomicUsize,
}

impl ChannelCore {
    /// Creates a core delivering events on `processor`.
    #[must_use]
    pub fn new(processor: Processor) -> Arc<Self> {
        Arc::new(Self {
            processor,
            callbacks: Mutex::new(Callbacks::default()),
            inbound: Queue::new(QueueLimit::Messages(RECV_QUEUE_LIMIT), Message::size),
            buffered_amount: AtomicUsize::new(0),
            buffered_amount_low_threshold: AtomicUsize::new(0),
        })
    }

    /// The serial executor events run on.
    #[inline]
    #[must_use]
    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn on_open(self: &Arc<Self>, callback: Option<OpenCallback>) {
        let replay = {
            let mut callbacks = self.callbacks.lock();
            callbacks.open = callback;
            callbacks.open.is_some() && std::mem::take(&mut callbacks.stored_open)
        };
        if replay {
            self.trigger_open();
        }
    }

    pub fn on_closed(self: &Arc<Self>, callback: Option<ClosedCallback>) {
        let replay = {
            let mut callbacks = self.callbacks.lock();
            callbacks.closed = callback;
            callbacks.closed.is_some() && std::mem::take(&mut callbacks.stored_closed)
        };
        if replay {
            self.trigger_closed();
        }
    }

    pub fn on_error(self: &Arc<Self>, callback: Option<ErrorCallback>) {
        let replay = {
            let mut callbacks = self.callbacks.lock();
            callbacks.error = callback;
            if callbacks.error.is_some() {
                std::mem::take(&mut callbacks.stored_errors)
            } else {
                Vec::new()
            }
        };
        for error in replay {
            self.trigger_error(error);
        }
    }

    /// Registers the message callback and flushes queued messages into it.
    pub fn on_message(self: &Arc<Self>, callback: Option<MessageCallback>) {
        let flush = callback.is_some();
        self.callbacks.lock().message = callback;
        if flush {
            let this = Arc::clone(self);
            self.processor.enqueue(move || this.flush_messages());
        }
    }

    pub fn on_available(&self, callback: Option<AvailableCallback>) {
        self.callbacks.lock().available = callback;
    }

    pub fn on_buffered_amount_low(&self, callback: Option<BufferedAmountLowCallback>) {
        self.callbacks.lock().buffered_amount_low = callback;
    }

    /// Drops every callback. Stored events are kept for later registration.
    pub fn reset_callbacks(&self) {
        let mut callbacks = self.callbacks.lock();
        callbacks.open = None;
        callbacks.closed = None;
        callbacks.error = None;
        callbacks.message = None;
        callbacks.available = None;
        callbacks.buffered_amount_low = None;
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Schedules the open event.
    pub fn trigger_open(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.processor.enqueue(move || this.deliver_open());
    }

    /// Schedules the closed event.
    pub fn trigger_closed(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.processor.enqueue(move || this.deliver_closed());
    }

    /// Schedules an error event.
    pub fn trigger_error(self: &Arc<Self>, error: String) {
        let this = Arc::clone(self);
        self.processor.enqueue(move || this.deliver_error(error));
    }

    /// Runs the open callback now, or stores the event.
    ///
    /// Only called from a task of this core's processor.
    pub(crate) fn deliver_open(&self) {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            if callbacks.open.is_none() {
                callbacks.stored_open = true;
            }
            callbacks.open.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub(crate) fn deliver_closed(&self) {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            if callbacks.closed.is_none() {
                callbacks.stored_closed = true;
            }
            callbacks.closed.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub(crate) fn deliver_error(&self, error: String) {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            if callbacks.error.is_none() {
                callbacks.stored_errors.push(error.clone());
            }
            callbacks.error.clone()
        };
        if let Some(callback) = callback {
            callback(error);
        }
    }

    /// Queues an inbound message and schedules delivery.
    ///
    /// The message is dropped with a warning when the queue is full.
    pub fn incoming(self: &Arc<Self>, message: Message) {
        if !message.kind.is_data() {
            return;
        }
        if let Err(QueueError::Full(dropped)) = self.inbound.push(message) {
            warn!(len = dropped.len(), limit = RECV_QUEUE_LIMIT, "Inbound queue full, message dropped");
            return;
        }

        let this = Arc::clone(self);
        self.processor.enqueue(move || {
            let count = this.inbound.len();
            let available = this.callbacks.lock().available.clone();
            if count > 0
                && let Some(callback) = available
            {
                callback(count);
            }
            this.flush_messages();
        });
    }

    /// Records a new buffered amount, firing the low callback when it
    /// crosses the threshold downward.
    pub fn update_buffered_amount(self: &Arc<Self>, amount: usize) {
        let previous = self.buffered_amount.swap(amount, Ordering::SeqCst);
        let threshold = self.buffered_amount_low_threshold.load(Ordering::SeqCst);
        if previous <= threshold || amount > threshold {
            return;
        }

        trace!(previous, amount, threshold, "Buffered amount low");
        let this = Arc::clone(self);
        self.processor.enqueue(move || {
            let callback = this.callbacks.lock().buffered_amount_low.clone();
            if let Some(callback) = callback {
                callback();
            }
        });
    }

    fn flush_messages(&self) {
        loop {
            let Some(callback) = self.callbacks.lock().message.clone() else {
                return;
            };
            let Some(data) = self.receive() else {
                return;
            };
            callback(data);
        }
    }

    // ========================================================================
    // Inbound Queue
    // ========================================================================

    /// Removes and returns the oldest inbound message.
    pub fn receive(&self) -> Option<MessageData> {
        while let Ok(message) = self.inbound.pop() {
            if let Some(data) = message.into_data() {
                return Some(data);
            }
        }
        None
    }

    /// Removes the oldest inbound message if it fits in `capacity` bytes.
    ///
    /// Text needs one extra byte for its NUL terminator.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAvailable`] if no message is queued
    /// - [`Error::BufferTooSmall`] with the size of the message at the
    ///   front, which stays queued
    pub fn receive_if_fits(&self, capacity: usize) -> Result<MessageData> {
        let mut required = 0;
        let popped = self.inbound.pop_if(|message| {
            required = required_size(message);
            required <= capacity
        });

        match popped {
            Ok(Some(message)) => message.into_data().ok_or(Error::NotAvailable),
            Ok(None) => Err(Error::buffer_too_small(required)),
            Err(_) => Err(Error::NotAvailable),
        }
    }

    /// Returns the oldest inbound message without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<MessageData> {
        self.inbound.peek().and_then(Message::into_data)
    }

    /// Total payload bytes waiting in the inbound queue.
    #[inline]
    #[must_use]
    pub fn available_amount(&self) -> usize {
        self.inbound.amount()
    }

    /// Number of inbound messages waiting.
    #[inline]
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.inbound.len()
    }

    /// Drops every inbound message.
    pub fn clear_inbound(&self) {
        self.inbound.drain();
    }

    // ========================================================================
    // Buffered Amount
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered_amount_low_threshold.store(threshold, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.buffered_amount_low_threshold.load(Ordering::SeqCst)
    }
}

/// Bytes needed to copy `message` out, including a text NUL.
fn required_size(message: &Message) -> usize {
    message.len() + usize::from(message.kind == MessageKind::Text)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::runtime::WorkerPool;
    use crate::test_support::wait_until;

    const WAIT: Duration = Duration::from_secs(5);

    fn core() -> Arc<ChannelCore> {
        let pool = Arc::new(WorkerPool::with_threads(4).unwrap());
        ChannelCore::new(Processor::new(pool))
    }

    fn log() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Arc<dyn Fn() + Send + Sync>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let make = move |name: &str| -> Arc<dyn Fn() + Send + Sync> {
            let sink = Arc::clone(&sink);
            let name = name.to_string();
            Arc::new(move || sink.lock().push(name.clone()))
        };
        (events, make)
    }

    #[test]
    fn test_stored_open_replayed_on_registration() {
        let core = core();
        core.trigger_open();
        core.processor().join();

        let (events, make) = log();
        core.on_open(Some(make("open")));
        assert!(wait_until(WAIT, || events.lock().len() == 1));

        core.processor().join();
        core.on_open(Some(make("open again")));
        core.processor().join();
        assert_eq!(*events.lock(), vec!["open".to_string()]);
    }

    #[test]
    fn test_error_precedes_closed() {
        let core = core();
        let (events, make) = log();
        let sink = Arc::clone(&events);
        core.on_error(Some(Arc::new(move |e| sink.lock().push(format!("error: {e}")))));
        core.on_closed(Some(make("closed")));

        core.trigger_error("refused".into());
        core.trigger_closed();
        core.processor().join();
        assert_eq!(*events.lock(), vec!["error: refused".to_string(), "closed".to_string()]);
    }

    #[test]
    fn test_stored_error_and_closed_replayed_in_order_of_registration() {
        let core = core();
        core.trigger_error("boom".into());
        core.trigger_closed();
        core.processor().join();

        let (events, make) = log();
        let sink = Arc::clone(&events);
        core.on_error(Some(Arc::new(move |e| sink.lock().push(e))));
        core.on_closed(Some(make("closed")));
        core.processor().join();
        assert_eq!(*events.lock(), vec!["boom".to_string(), "closed".to_string()]);
    }

    #[test]
    fn test_messages_queue_until_callback() {
        let core = core();
        core.incoming(Message::text("one"));
        core.incoming(Message::binary(vec![2u8]));
        core.processor().join();
        assert_eq!(core.available_count(), 2);
        assert_eq!(core.available_amount(), 4);
        assert_eq!(core.peek(), Some(MessageData::Text("one".into())));
        assert_eq!(core.available_count(), 2);

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        core.on_message(Some(Arc::new(move |m| sink.lock().push(m))));
        core.processor().join();
        assert_eq!(
            *got.lock(),
            vec![MessageData::Text("one".into()), MessageData::Binary(vec![2])]
        );
        assert_eq!(core.available_count(), 0);
    }

    #[test]
    fn test_receive_removes_one() {
        let core = core();
        core.incoming(Message::text("a"));
        core.incoming(Message::text("b"));
        assert_eq!(core.receive(), Some(MessageData::Text("a".into())));
        assert_eq!(core.receive(), Some(MessageData::Text("b".into())));
        assert_eq!(core.receive(), None);
        assert_eq!(core.peek(), None);
    }

    #[test]
    fn test_receive_if_fits_checks_the_message_it_removes() {
        let core = core();
        assert!(matches!(core.receive_if_fits(16), Err(Error::NotAvailable)));

        core.incoming(Message::text("hello"));
        assert!(matches!(
            core.receive_if_fits(5),
            Err(Error::BufferTooSmall { required: 6 })
        ));
        assert_eq!(core.available_count(), 1);
        assert_eq!(core.receive_if_fits(6).unwrap(), MessageData::Text("hello".into()));
    }

    #[test]
    fn test_available_callback_reports_count() {
        let core = core();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&counts);
        core.on_available(Some(Arc::new(move |n| sink.lock().push(n))));
        core.incoming(Message::text("x"));
        core.processor().join();
        assert_eq!(*counts.lock(), vec![1]);
    }

    #[test]
    fn test_inbound_overflow_drops_newest() {
        let core = core();
        for i in 0..RECV_QUEUE_LIMIT + 10 {
            core.incoming(Message::text(i.to_string()));
        }
        core.processor().join();
        assert_eq!(core.available_count(), RECV_QUEUE_LIMIT);
        assert_eq!(core.receive(), Some(MessageData::Text("0".into())));
    }

    #[test]
    fn test_buffered_amount_low_fires_on_downward_crossing() {
        let core = core();
        let (events, make) = log();
        core.on_buffered_amount_low(Some(make("low")));
        core.set_buffered_amount_low_threshold(100);

        core.update_buffered_amount(50);
        core.update_buffered_amount(500);
        core.update_buffered_amount(200);
        core.update_buffered_amount(100);
        core.update_buffered_amount(0);
        core.processor().join();
        assert_eq!(*events.lock(), vec!["low".to_string()]);
        assert_eq!(core.buffered_amount(), 0);
    }

    #[test]
    fn test_reset_callbacks_keeps_stored_events() {
        let core = core();
        let (events, make) = log();
        core.on_closed(Some(make("dropped")));
        core.reset_callbacks();
        core.trigger_closed();
        core.processor().join();
        assert!(events.lock().is_empty());

        core.on_closed(Some(make("closed")));
        core.processor().join();
        assert_eq!(*events.lock(), vec!["closed".to_string()]);
    }
}
