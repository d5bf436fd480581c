use std::{
    num::NonZeroU64,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{FusedStream, Stream};
use rhubarb_proto::{Message, ServerMessage, Subject, SubscriptionId};
use tokio::{sync::mpsc, time};

use crate::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    client::{Client, ConnectionStatus},
    error::{Error, ErrorKind},
};

const BATCH_RECEIVE_SIZE: usize = 16;

/// Delivery accounting shared between the handler task and the consumer
///
/// The handler admits or drops arriving messages against the pending
/// limits; the consumer side decrements the pending counters as messages
/// are handed to the application.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    pending_msgs: AtomicUsize,
    pending_bytes: AtomicUsize,
    limit_msgs: AtomicUsize,
    limit_bytes: AtomicUsize,
    hwm_msgs: AtomicUsize,
    hwm_bytes: AtomicUsize,
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    slow: AtomicBool,
    max_messages: AtomicU64,
}

/// Outcome of offering an arriving message to a subscription
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    /// The message must be dropped; `first` is set when this drop begins
    /// a new slow-consumer episode
    Drop { first: bool },
}

impl SubscriptionState {
    pub(crate) fn new(limit_msgs: usize) -> Self {
        Self {
            pending_msgs: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
            limit_msgs: AtomicUsize::new(limit_msgs),
            limit_bytes: AtomicUsize::new(0),
            hwm_msgs: AtomicUsize::new(0),
            hwm_bytes: AtomicUsize::new(0),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slow: AtomicBool::new(false),
            max_messages: AtomicU64::new(0),
        }
    }

    /// Handler side: decide whether an arriving message fits under the
    /// pending limits, updating the counters accordingly.
    pub(crate) fn admit(&self, payload_len: usize) -> Admission {
        let pending = self.pending_msgs.load(Ordering::Acquire);

        // A drained queue ends the slow-consumer episode
        if pending == 0 {
            self.slow.store(false, Ordering::Release);
        }

        let limit_msgs = self.limit_msgs.load(Ordering::Acquire);
        let limit_bytes = self.limit_bytes.load(Ordering::Acquire);
        let pending_bytes = self.pending_bytes.load(Ordering::Acquire);
        let over_msgs = limit_msgs != 0 && pending >= limit_msgs;
        let over_bytes = limit_bytes != 0 && pending_bytes + payload_len > limit_bytes;
        if over_msgs || over_bytes {
            let first = self.drop_overflow();
            return Admission::Drop { first };
        }

        let pending = pending + 1;
        let pending_bytes = pending_bytes + payload_len;
        self.pending_msgs.store(pending, Ordering::Release);
        self.pending_bytes.store(pending_bytes, Ordering::Release);
        self.hwm_msgs.fetch_max(pending, Ordering::AcqRel);
        self.hwm_bytes.fetch_max(pending_bytes, Ordering::AcqRel);
        Admission::Accept
    }

    /// Handler side: undo an admission that could not be enqueued.
    pub(crate) fn retract(&self, payload_len: usize) {
        saturating_decrement(&self.pending_msgs, 1);
        saturating_decrement(&self.pending_bytes, payload_len);
    }

    /// Handler side: a message had to be dropped. Returns whether this
    /// drop begins a new slow-consumer episode.
    pub(crate) fn drop_overflow(&self) -> bool {
        self.dropped.fetch_add(1, Ordering::AcqRel);
        !self.slow.swap(true, Ordering::AcqRel)
    }

    /// Handler side: a message arrived for this subscription. Returns
    /// the new received count, which the auto-unsubscribe maximum is
    /// compared against.
    pub(crate) fn note_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Consumer side: a message has been handed to the application.
    pub(crate) fn note_delivered(&self, payload_len: usize) {
        saturating_decrement(&self.pending_msgs, 1);
        saturating_decrement(&self.pending_bytes, payload_len);
        self.delivered.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn pending_msgs(&self) -> usize {
        self.pending_msgs.load(Ordering::Acquire)
    }

    pub(crate) fn set_limits(&self, max_msgs: usize, max_bytes: usize) {
        self.limit_msgs.store(max_msgs, Ordering::Release);
        self.limit_bytes.store(max_bytes, Ordering::Release);
    }

    pub(crate) fn set_max_messages(&self, max: u64) {
        self.max_messages.store(max, Ordering::Release);
    }

    pub(crate) fn max_messages(&self) -> u64 {
        self.max_messages.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            pending_msgs: self.pending_msgs.load(Ordering::Acquire),
            pending_bytes: self.pending_bytes.load(Ordering::Acquire),
            max_pending_msgs: self.hwm_msgs.load(Ordering::Acquire),
            max_pending_bytes: self.hwm_bytes.load(Ordering::Acquire),
            delivered: self.delivered.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
        }
    }
}

fn saturating_decrement(counter: &AtomicUsize, by: usize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |val| {
        Some(val.saturating_sub(by))
    });
}

/// Delivery statistics for one subscription
///
/// Obtained from [`Subscription::stats`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Messages queued and not yet handed to the application
    pub pending_msgs: usize,
    /// Payload bytes queued and not yet handed to the application
    pub pending_bytes: usize,
    /// High-water mark of `pending_msgs`
    pub max_pending_msgs: usize,
    /// High-water mark of `pending_bytes`
    pub max_pending_bytes: usize,
    /// Messages handed to the application
    pub delivered: u64,
    /// Messages dropped because the pending queue was full
    pub dropped: u64,
}

/// A subscription to a subject
///
/// Messages are consumed either synchronously with
/// [`Subscription::next_message`], through the [`Stream`]
/// implementation, or by a handler task when created via
/// `Client::subscribe_with`.
///
/// When the pending queue fills up the subscription enters the
/// slow-consumer state: arriving messages are dropped and counted until
/// the queue drains. The first [`Subscription::next_message`] call after
/// a drop reports it once as `ErrorKind::SlowConsumer`.
///
/// Dropping the handle lazily unsubscribes from the server.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    subject: Subject,
    client: Client,
    receiver: Option<mpsc::Receiver<ServerMessage>>,
    receiver_queue: Vec<ServerMessage>,
    state: Arc<SubscriptionState>,
    seen_dropped: u64,
    unsubscribed: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        subject: Subject,
        client: Client,
        receiver: mpsc::Receiver<ServerMessage>,
        state: Arc<SubscriptionState>,
    ) -> Self {
        Self {
            id,
            subject,
            client,
            receiver: Some(receiver),
            receiver_queue: Vec::with_capacity(BATCH_RECEIVE_SIZE),
            state,
            seen_dropped: 0,
            unsubscribed: false,
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn state(&self) -> &Arc<SubscriptionState> {
        &self.state
    }

    /// Hand the message channel over to a dispatcher task.
    pub(crate) fn take_receiver(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.receiver.take()
    }

    /// The subject this subscription was created with
    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// # Errors
    ///
    /// * `ErrorKind::Timeout` if no message arrived in time
    /// * `ErrorKind::SlowConsumer`, once, after messages have been
    ///   dropped
    /// * `ErrorKind::MaxMessagesDelivered` once the auto-unsubscribe
    ///   maximum has been reached
    /// * `ErrorKind::ConnectionClosed` / `ErrorKind::InvalidSubscription`
    ///   when the client or the subscription has closed
    /// * `ErrorKind::IllegalState` if the subscription delivers to a
    ///   handler
    pub async fn next_message(&mut self, timeout: Duration) -> Result<Message, Error> {
        let dropped = self.state.dropped();
        if dropped > self.seen_dropped {
            self.seen_dropped = dropped;
            return Err(Error::new(ErrorKind::SlowConsumer));
        }

        if let Some(server_message) = self.receiver_queue.pop() {
            self.state
                .note_delivered(server_message.message.payload.len());
            return Ok(server_message.message);
        }

        let Some(receiver) = &mut self.receiver else {
            return Err(Error::new(ErrorKind::IllegalState));
        };

        match time::timeout(timeout, receiver.recv()).await {
            Err(_elapsed) => Err(Error::new(ErrorKind::Timeout)),
            Ok(Some(server_message)) => {
                self.state
                    .note_delivered(server_message.message.payload.len());
                Ok(server_message.message)
            }
            Ok(None) => Err(self.closed_error()),
        }
    }

    /// Remove this subscription from the server.
    ///
    /// Calling this method multiple times is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn unsubscribe(&mut self) -> Result<(), Error> {
        if self.unsubscribed || self.is_channel_closed() {
            self.unsubscribed = true;
            return Ok(());
        }

        self.client.unsubscribe(self.id, None).await?;
        self.unsubscribed = true;
        Ok(())
    }

    /// Remove this subscription automatically after `max` total messages
    /// have been delivered.
    ///
    /// A `max` of zero unsubscribes immediately.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn auto_unsubscribe(&mut self, max: u64) -> Result<(), Error> {
        let Some(max) = NonZeroU64::new(max) else {
            return self.unsubscribe().await;
        };

        if self.unsubscribed || self.is_channel_closed() {
            return Ok(());
        }

        self.state.set_max_messages(max.get());
        self.client.unsubscribe(self.id, Some(max)).await
    }

    /// Whether the subscription can still receive messages
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.unsubscribed && !self.is_channel_closed()
    }

    /// Messages queued for delivery
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.state.pending_msgs()
    }

    /// Bound the pending queue
    ///
    /// `max_msgs` and `max_bytes` of zero mean "no limit" for that
    /// dimension. Arrivals beyond either limit are dropped and counted.
    pub fn set_pending_limits(&self, max_msgs: usize, max_bytes: usize) {
        self.state.set_limits(max_msgs, max_bytes);
    }

    /// Delivery statistics
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.state.snapshot()
    }

    /// Poll for the next message, keeping the server-assigned status
    /// code. The request/reply path needs the status to spot
    /// no-responders notifications.
    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<ServerMessage>> {
        if let Some(server_message) = self.receiver_queue.pop() {
            self.state
                .note_delivered(server_message.message.payload.len());
            return Poll::Ready(Some(server_message));
        }

        let Some(receiver) = &mut self.receiver else {
            return Poll::Ready(None);
        };

        match receiver.poll_recv_many(cx, &mut self.receiver_queue, BATCH_RECEIVE_SIZE) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(n @ 1..) => {
                debug_assert_eq!(n, self.receiver_queue.len());
                self.receiver_queue.reverse();
                let server_message = self.receiver_queue.pop().unwrap();
                self.state
                    .note_delivered(server_message.message.payload.len());
                Poll::Ready(Some(server_message))
            }
            Poll::Ready(0) => Poll::Ready(None),
        }
    }

    fn is_channel_closed(&self) -> bool {
        self.receiver.as_ref().is_some_and(mpsc::Receiver::is_closed)
    }

    fn closed_error(&self) -> Error {
        let max = self.state.max_messages();
        if max != 0 && self.state.received() >= max {
            Error::new(ErrorKind::MaxMessagesDelivered)
        } else if self.client.status() == ConnectionStatus::Closed {
            Error::new(ErrorKind::ConnectionClosed)
        } else {
            Error::new(ErrorKind::InvalidSubscription)
        }
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .poll_recv(cx)
            .map(|maybe| maybe.map(|server_message| server_message.message))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.receiver_queue.len(), None)
    }
}

impl FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        self.receiver_queue.is_empty()
            && self
                .receiver
                .as_ref()
                .map_or(true, mpsc::Receiver::is_closed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.unsubscribed || self.is_channel_closed() {
            return;
        }

        self.client.lazy_unsubscribe(self.id, None);
    }
}

#[cfg(test)]
mod tests {
    use super::{Admission, SubscriptionState};

    #[test]
    fn admission_respects_message_limit() {
        let state = SubscriptionState::new(2);
        assert_eq!(Admission::Accept, state.admit(1));
        assert_eq!(Admission::Accept, state.admit(1));
        assert_eq!(Admission::Drop { first: true }, state.admit(1));
        assert_eq!(Admission::Drop { first: false }, state.admit(1));
        assert_eq!(2, state.dropped());
        assert_eq!(2, state.pending_msgs());
    }

    #[test]
    fn draining_clears_the_slow_consumer_episode() {
        let state = SubscriptionState::new(1);
        assert_eq!(Admission::Accept, state.admit(4));
        assert_eq!(Admission::Drop { first: true }, state.admit(4));

        state.note_delivered(4);
        assert_eq!(0, state.pending_msgs());

        // The next arrival starts a fresh episode
        assert_eq!(Admission::Accept, state.admit(4));
        assert_eq!(Admission::Drop { first: true }, state.admit(4));
    }

    #[test]
    fn admission_respects_byte_limit() {
        let state = SubscriptionState::new(0);
        state.set_limits(0, 10);
        assert_eq!(Admission::Accept, state.admit(8));
        assert_eq!(Admission::Drop { first: true }, state.admit(8));
        state.note_delivered(8);
        assert_eq!(Admission::Accept, state.admit(8));
    }

    #[test]
    fn high_water_marks_track_peaks() {
        let state = SubscriptionState::new(0);
        state.admit(10);
        state.admit(20);
        state.note_delivered(10);
        state.admit(5);

        let stats = state.snapshot();
        assert_eq!(2, stats.pending_msgs);
        assert_eq!(25, stats.pending_bytes);
        assert_eq!(2, stats.max_pending_msgs);
        assert_eq!(30, stats.max_pending_bytes);
        assert_eq!(1, stats.delivered);
    }
}
