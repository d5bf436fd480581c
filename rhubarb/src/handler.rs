use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    num::NonZeroU64,
    ops::ControlFlow,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use rhubarb_net::{error::StreamingReadError, Connector, TcpConnection};
use rhubarb_proto::{
    proto::{ClientOp, ServerOp},
    Message, QueueGroup, ServerAddr, ServerMessage, Subject, SubscriptionId,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, Sleep},
};

use crate::{
    client::{builder::ClientBuilder, state::SharedState, ConnectionStatus},
    error::{Error, ErrorKind},
    events::Event,
    subscription::{Admission, SubscriptionState},
};

/// The reserved id of the shared request/reply subscription
pub(crate) const MULTIPLEXED_SUBSCRIPTION_ID: SubscriptionId = SubscriptionId::MIN;
const RECV_BUF: usize = 16;
/// How long a dying connection gets to drain its write buffer
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// The connection actor
///
/// One `Handler` owns one established connection and every piece of
/// per-connection state: the outgoing write buffer, the subscription
/// table, the heartbeat timer and the flush correlation queue. Its
/// [`Future`] implementation multiplexes socket reads, command intake
/// from the [`Client`] handles, socket writes and flushing in a single
/// poll loop, resolving once the connection is lost
/// ([`HandlerOutput::Disconnected`]), the server turns fatal
/// ([`HandlerOutput::ServerError`]) or the client shuts down
/// ([`HandlerOutput::Closed`]).
///
/// [`Client`]: crate::Client
#[derive(Debug)]
pub(crate) struct Handler {
    conn: TcpConnection,
    shared: Arc<SharedState>,
    events: mpsc::UnboundedSender<Event>,
    delayed_flusher: Option<DelayedFlusher>,
    flushing: bool,
    shutting_down: bool,

    ping_interval: Duration,
    max_pings_out: u32,
    ping_timer: Pin<Box<Sleep>>,
    outstanding_pings: u32,

    commands: mpsc::Receiver<HandlerCommand>,
    recv_buf: Vec<HandlerCommand>,

    subscriptions: BTreeMap<SubscriptionId, SubscriptionEntry>,
    multiplexed_prefix: Subject,
    multiplexed: Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,

    flush_waiters: VecDeque<oneshot::Sender<()>>,
    awaiting_close: Vec<oneshot::Sender<()>>,

    reconnect_buf_size: usize,
}

#[derive(Debug)]
struct DelayedFlusher {
    // INVARIANT: `interval != Duration::ZERO`
    interval: Duration,
    delay: Pin<Box<Option<Sleep>>>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    subject: Subject,
    queue_group: Option<QueueGroup>,
    messages: mpsc::Sender<ServerMessage>,
    state: Arc<SubscriptionState>,
}

#[derive(Debug)]
pub(crate) enum HandlerCommand {
    Publish {
        message: Message,
    },
    RequestMultiplexed {
        subject: Subject,
        reply_subject: Subject,
        payload: Bytes,
        reply: oneshot::Sender<ServerMessage>,
    },
    UnsubscribeMultiplexed {
        reply_subject: Subject,
    },
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        messages: mpsc::Sender<ServerMessage>,
        state: Arc<SubscriptionState>,
    },
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) enum HandlerOutput {
    /// The server reported a fatal error; the connection must close
    ServerError,
    /// The connection was lost; the driver may reconnect
    Disconnected,
    /// The client asked to shut down and the write buffer is drained
    Closed,
}

impl Handler {
    /// Establish a connection to `addr` and arm a new handler around it.
    ///
    /// The whole handshake runs under the configured connect timeout.
    /// On success every live subscription is re-issued, the pending
    /// buffer is replayed and any flush waiters are re-anchored with a
    /// fresh PING.
    pub(crate) async fn connect(
        connector: &Connector,
        addr: &ServerAddr,
        builder: &ClientBuilder,
        recycle: RecycledHandler,
    ) -> Result<Self, (Error, RecycledHandler)> {
        let connect = builder.connect_document(addr);
        let outcome = match time::timeout(
            builder.connect_timeout,
            connector.connect(addr, connect, builder.secure),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return Err((err.into(), recycle)),
            Err(_elapsed) => {
                return Err((
                    Error::with_detail(ErrorKind::Timeout, "connect handshake timed out"),
                    recycle,
                ))
            }
        };

        let RecycledHandler {
            commands,
            shared,
            events,
            multiplexed_prefix,
            mut subscriptions,
            multiplexed,
            flush_waiters,
            awaiting_close,
            mut pending,
            close_requested: _,
        } = recycle;

        let mut conn = outcome.conn;
        shared.store_info(outcome.info);

        // Re-issue every surviving subscription, with the remainder of
        // its auto-unsubscribe allowance
        subscriptions.retain(|&id, entry| {
            let max = entry.state.max_messages();
            let received = entry.state.received();
            if max != 0 && received >= max {
                return false;
            }

            conn.enqueue_write_op(&ClientOp::Subscribe {
                id,
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
            });
            if max != 0 {
                conn.enqueue_write_op(&ClientOp::Unsubscribe {
                    id,
                    max_messages: NonZeroU64::new(max - received),
                });
            }
            true
        });

        if multiplexed.is_some() {
            enqueue_multiplexed_subscribe(&mut conn, &multiplexed_prefix);
        }

        for message in pending.drain() {
            shared.record_out_message(message.payload.len());
            conn.enqueue_write_op(&ClientOp::Publish { message });
        }
        shared.store_pending_bytes(0);

        if !flush_waiters.is_empty() {
            conn.enqueue_write_op(&ClientOp::Ping);
        }

        shared.store_status(ConnectionStatus::Connected);

        let delayed_flusher = if builder.flush_interval.is_zero() {
            None
        } else {
            Some(DelayedFlusher {
                interval: builder.flush_interval,
                delay: Box::pin(None),
            })
        };

        Ok(Self {
            conn,
            shared,
            events,
            delayed_flusher,
            flushing: false,
            shutting_down: false,
            ping_interval: builder.ping_interval,
            max_pings_out: builder.max_pings_out,
            ping_timer: Box::pin(time::sleep(builder.ping_interval)),
            outstanding_pings: 0,
            commands,
            recv_buf: Vec::with_capacity(RECV_BUF),
            subscriptions,
            multiplexed_prefix,
            multiplexed,
            flush_waiters,
            awaiting_close,
            reconnect_buf_size: builder.reconnect_buf_size,
        })
    }

    /// Tear the connection down after a disconnect, keeping everything
    /// needed to resume on a new connection.
    pub(crate) async fn recycle(mut self) -> RecycledHandler {
        let _ = time::timeout(DISCONNECT_FLUSH_TIMEOUT, self.conn.write_and_flush()).await;
        let _ = self.conn.shutdown().await;

        RecycledHandler {
            commands: self.commands,
            shared: self.shared,
            events: self.events,
            multiplexed_prefix: self.multiplexed_prefix,
            subscriptions: self.subscriptions,
            multiplexed: self.multiplexed,
            flush_waiters: self.flush_waiters,
            awaiting_close: self.awaiting_close,
            pending: PendingBuffer::new(self.reconnect_buf_size),
            close_requested: false,
        }
    }

    /// Complete a graceful close: flush, shut the socket and release the
    /// close waiters. The poll loop only yields [`HandlerOutput::Closed`]
    /// once the write buffer is drained, so this flush is a formality.
    pub(crate) async fn finish_close(mut self) {
        let _ = time::timeout(DISCONNECT_FLUSH_TIMEOUT, self.conn.write_and_flush()).await;
        let _ = self.conn.shutdown().await;

        for waiter in self.awaiting_close.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn handle_server_op(&mut self, server_op: ServerOp) -> ControlFlow<HandlerOutput, ()> {
        match server_op {
            ServerOp::Message { message }
                if message.subscription_id == MULTIPLEXED_SUBSCRIPTION_ID =>
            {
                self.shared
                    .record_in_message(message.message.payload.len());

                let Some(multiplexed) = &mut self.multiplexed else {
                    return ControlFlow::Continue(());
                };
                if let Some(reply) = multiplexed.remove(&message.message.subject) {
                    let _ = reply.send(message);
                }
            }
            ServerOp::Message { message } => {
                let subscription_id = message.subscription_id;
                let payload_len = message.message.payload.len();
                self.shared.record_in_message(payload_len);

                let Some(entry) = self.subscriptions.get(&subscription_id) else {
                    // Unsubscribed while messages were in flight
                    return ControlFlow::Continue(());
                };
                let state = Arc::clone(&entry.state);
                let messages = entry.messages.clone();

                let max = state.max_messages();
                if max != 0 && state.received() >= max {
                    self.subscriptions.remove(&subscription_id);
                    return ControlFlow::Continue(());
                }

                match state.admit(payload_len) {
                    Admission::Drop { first } => {
                        if first {
                            self.report_slow_consumer(subscription_id);
                        }
                        let received = state.note_received();
                        if max != 0 && received >= max {
                            self.subscriptions.remove(&subscription_id);
                        }
                    }
                    Admission::Accept => match messages.try_send(message) {
                        Ok(()) => {
                            let received = state.note_received();
                            if max != 0 && received >= max {
                                self.subscriptions.remove(&subscription_id);
                            }
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            state.retract(payload_len);
                            state.note_received();
                            if state.drop_overflow() {
                                self.report_slow_consumer(subscription_id);
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            self.subscriptions.remove(&subscription_id);
                            self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                                id: subscription_id,
                                max_messages: None,
                            });
                        }
                    },
                }
            }
            ServerOp::Success => {
                // `+OK` in verbose mode carries no information
            }
            ServerOp::Error { error } if error.is_stale_connection() => {
                self.shared
                    .record_error(&Error::new(ErrorKind::StaleConnection));
                return ControlFlow::Break(HandlerOutput::Disconnected);
            }
            ServerOp::Error { error } => {
                self.shared
                    .record_error(&Error::with_detail(ErrorKind::Protocol, error.to_string()));
                return ControlFlow::Break(HandlerOutput::ServerError);
            }
            ServerOp::Ping => {
                self.conn.enqueue_write_op(&ClientOp::Pong);
            }
            ServerOp::Pong => {
                self.outstanding_pings = 0;

                // A PONG orders after everything written before its PING,
                // so it completes every pending flush
                for waiter in self.flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Info { info } => {
                self.shared.store_info(info);
            }
        }

        ControlFlow::Continue(())
    }

    #[cold]
    fn report_slow_consumer(&self, id: SubscriptionId) {
        let err = Error::with_detail(
            ErrorKind::SlowConsumer,
            format!("subscription {id} dropped a message"),
        );
        self.shared.record_error(&err);
        let _ = self.events.send(Event::AsyncError(err));
    }

    #[cold]
    fn ping(&mut self, cx: &mut Context<'_>) -> Result<(), HandlerOutput> {
        if self.outstanding_pings >= self.max_pings_out {
            self.shared
                .record_error(&Error::new(ErrorKind::StaleConnection));
            return Err(HandlerOutput::Disconnected);
        }

        loop {
            self.reset_ping_timer();
            if Pin::new(&mut self.ping_timer).poll(cx).is_pending() {
                break;
            }
        }

        self.conn.enqueue_write_op(&ClientOp::Ping);
        self.outstanding_pings += 1;
        Ok(())
    }

    fn reset_ping_timer(&mut self) {
        Sleep::reset(self.ping_timer.as_mut(), Instant::now() + self.ping_interval);
    }

    fn handle_command(&mut self, cmd: HandlerCommand) {
        match cmd {
            HandlerCommand::Publish { message } => {
                self.shared.record_out_message(message.payload.len());
                self.conn.enqueue_write_op(&ClientOp::Publish { message });
            }
            HandlerCommand::RequestMultiplexed {
                subject,
                reply_subject,
                payload,
                reply,
            } => {
                debug_assert!(reply_subject.starts_with(&*self.multiplexed_prefix));

                if self.multiplexed.is_none() {
                    enqueue_multiplexed_subscribe(&mut self.conn, &self.multiplexed_prefix);
                }
                self.multiplexed
                    .get_or_insert_with(BTreeMap::new)
                    .insert(reply_subject.clone(), reply);

                self.shared.record_out_message(payload.len());
                self.conn.enqueue_write_op(&ClientOp::Publish {
                    message: Message {
                        subject,
                        reply_subject: Some(reply_subject),
                        payload,
                    },
                });
            }
            HandlerCommand::UnsubscribeMultiplexed { reply_subject } => {
                if let Some(multiplexed) = &mut self.multiplexed {
                    let _ = multiplexed.remove(&reply_subject);
                }
            }
            HandlerCommand::Subscribe {
                id,
                subject,
                queue_group,
                messages,
                state,
            } => {
                self.conn.enqueue_write_op(&ClientOp::Subscribe {
                    id,
                    subject: subject.clone(),
                    queue_group: queue_group.clone(),
                });
                self.subscriptions.insert(
                    id,
                    SubscriptionEntry {
                        subject,
                        queue_group,
                        messages,
                        state,
                    },
                );
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: Some(max_messages),
            } => match self.subscriptions.get(&id) {
                Some(entry) if entry.state.received() < max_messages.get() => {
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: Some(max_messages),
                    });
                }
                Some(_) => {
                    // The maximum was already reached on the way in
                    self.subscriptions.remove(&id);
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: None,
                    });
                }
                // Removed by ingress before the command arrived; make
                // sure the server stops sending too
                None => self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                    id,
                    max_messages: None,
                }),
            },
            HandlerCommand::Unsubscribe {
                id,
                max_messages: None,
            } => {
                if self.subscriptions.remove(&id).is_some() {
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: None,
                    });
                }
            }
            HandlerCommand::Flush { reply } => {
                self.flush_waiters.push_back(reply);
                self.conn.enqueue_write_op(&ClientOp::Ping);
            }
            HandlerCommand::Close(sender) => {
                self.shutting_down = true;
                self.awaiting_close.push(sender);
                self.commands.close();
            }
        }
    }

    fn receive_commands(&mut self, cx: &mut Context<'_>) -> ReceiveOutcome {
        while self.conn.may_enqueue_more_ops() {
            debug_assert!(self.recv_buf.is_empty());

            match self
                .commands
                .poll_recv_many(cx, &mut self.recv_buf, RECV_BUF)
            {
                Poll::Pending => return ReceiveOutcome::NoMoreCommands,
                Poll::Ready(1..) => {
                    let mut recv_buf = std::mem::take(&mut self.recv_buf);
                    for cmd in recv_buf.drain(..) {
                        self.handle_command(cmd);
                    }
                    self.recv_buf = recv_buf;
                }
                Poll::Ready(0) => {
                    // Every client handle is gone
                    self.shutting_down = true;
                    return ReceiveOutcome::NoMoreCommands;
                }
            }
        }

        ReceiveOutcome::NoMoreSpace
    }
}

#[derive(Debug, Copy, Clone)]
enum ReceiveOutcome {
    NoMoreCommands,
    NoMoreSpace,
}

impl Future for Handler {
    type Output = HandlerOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.ping_interval.is_zero() && Pin::new(&mut this.ping_timer).poll(cx).is_ready() {
            if let Err(output) = this.ping(cx) {
                return Poll::Ready(output);
            }
        }

        let mut handled_server_op = false;
        loop {
            match this.conn.poll_read_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Ok(server_op)) => {
                    if let ControlFlow::Break(output) = this.handle_server_op(server_op) {
                        return Poll::Ready(output);
                    }
                    handled_server_op = true;
                }
                Poll::Ready(Err(err)) => {
                    this.shared.record_error(&match err {
                        StreamingReadError::Decoder(err) => {
                            Error::with_detail(ErrorKind::Protocol, err.to_string())
                        }
                        StreamingReadError::Io(err) => {
                            Error::with_detail(ErrorKind::Io, err.to_string())
                        }
                    });
                    return Poll::Ready(HandlerOutput::Disconnected);
                }
            }
        }
        if handled_server_op {
            this.reset_ping_timer();
        }

        loop {
            let receive_outcome = this.receive_commands(cx);
            let write_blocked = if this.conn.may_write() {
                match this.conn.poll_write_next(cx) {
                    Poll::Pending => true,
                    Poll::Ready(Ok(_n)) => false,
                    Poll::Ready(Err(err)) => {
                        this.shared
                            .record_error(&Error::with_detail(ErrorKind::Io, err.to_string()));
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            } else {
                true
            };

            if !this.conn.may_flush() {
                // Nothing is sitting in the socket buffers
                this.flushing = false;
            } else if matches!(receive_outcome, ReceiveOutcome::NoMoreCommands) {
                // Everything available has been written; time to flush
                this.flushing = true;
                if let Some(delayed_flusher) = &mut this.delayed_flusher {
                    if delayed_flusher.delay.is_none() {
                        delayed_flusher
                            .delay
                            .set(Some(time::sleep(delayed_flusher.interval)));
                    }
                }
            }

            match (receive_outcome, write_blocked) {
                (ReceiveOutcome::NoMoreCommands | ReceiveOutcome::NoMoreSpace, true) => {
                    // No progress to be made right now
                    break;
                }
                (_, false) => continue,
            }
        }

        if this.flushing {
            let mut can_flush = true;
            if let Some(delayed_flusher) = &mut this.delayed_flusher {
                if let Some(delay) = delayed_flusher.delay.as_mut().as_pin_mut() {
                    if delay.poll(cx).is_ready() {
                        delayed_flusher.delay.set(None);
                    } else {
                        can_flush = false;
                    }
                }
            }

            if can_flush {
                match this.conn.poll_flush(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => this.flushing = false,
                    Poll::Ready(Err(err)) => {
                        this.shared
                            .record_error(&Error::with_detail(ErrorKind::Io, err.to_string()));
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            }
        }

        if this.shutting_down && !this.conn.may_write() && !this.conn.may_flush() {
            Poll::Ready(HandlerOutput::Closed)
        } else {
            Poll::Pending
        }
    }
}

fn enqueue_multiplexed_subscribe(conn: &mut TcpConnection, prefix: &Subject) {
    conn.enqueue_write_op(&ClientOp::Subscribe {
        id: MULTIPLEXED_SUBSCRIPTION_ID,
        subject: Subject::from_dangerous_value(format!("{prefix}.*").into()),
        queue_group: None,
    });
}

/// The connection-independent half of the handler, alive while the
/// driver walks the server pool
///
/// Commands keep arriving while disconnected: subscription changes are
/// applied to the table so they can be replayed on the next connection,
/// and publishes land in the bounded pending buffer.
#[derive(Debug)]
pub(crate) struct RecycledHandler {
    commands: mpsc::Receiver<HandlerCommand>,
    shared: Arc<SharedState>,
    events: mpsc::UnboundedSender<Event>,

    multiplexed_prefix: Subject,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionEntry>,
    multiplexed: Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,

    flush_waiters: VecDeque<oneshot::Sender<()>>,
    awaiting_close: Vec<oneshot::Sender<()>>,

    pending: PendingBuffer,
    close_requested: bool,
}

impl RecycledHandler {
    pub(crate) fn new(
        commands: mpsc::Receiver<HandlerCommand>,
        shared: Arc<SharedState>,
        events: mpsc::UnboundedSender<Event>,
        builder: &ClientBuilder,
    ) -> Self {
        Self {
            commands,
            shared,
            events,
            multiplexed_prefix: crate::client::create_inbox_subject(&builder.inbox_prefix),
            subscriptions: BTreeMap::new(),
            multiplexed: None,
            flush_waiters: VecDeque::new(),
            awaiting_close: Vec::new(),
            pending: PendingBuffer::new(builder.reconnect_buf_size),
            close_requested: false,
        }
    }

    pub(crate) fn multiplexed_prefix(&self) -> &Subject {
        &self.multiplexed_prefix
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Keep absorbing commands for up to `wait`, the spacing between two
    /// reconnect attempts.
    pub(crate) async fn idle_for(&mut self, wait: Duration) {
        let sleep = time::sleep(wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        self.absorb(cmd);
                        if self.close_requested {
                            break;
                        }
                    }
                    None => {
                        self.close_requested = true;
                        break;
                    }
                },
            }
        }
    }

    /// Apply a command that arrived while disconnected.
    fn absorb(&mut self, cmd: HandlerCommand) {
        match cmd {
            HandlerCommand::Publish { message } => self.buffer_publish(message),
            HandlerCommand::RequestMultiplexed {
                subject,
                reply_subject,
                payload,
                reply,
            } => {
                self.multiplexed
                    .get_or_insert_with(BTreeMap::new)
                    .insert(reply_subject.clone(), reply);
                self.buffer_publish(Message {
                    subject,
                    reply_subject: Some(reply_subject),
                    payload,
                });
            }
            HandlerCommand::UnsubscribeMultiplexed { reply_subject } => {
                if let Some(multiplexed) = &mut self.multiplexed {
                    let _ = multiplexed.remove(&reply_subject);
                }
            }
            HandlerCommand::Subscribe {
                id,
                subject,
                queue_group,
                messages,
                state,
            } => {
                self.subscriptions.insert(
                    id,
                    SubscriptionEntry {
                        subject,
                        queue_group,
                        messages,
                        state,
                    },
                );
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: Some(max_messages),
            } => {
                if let Some(entry) = self.subscriptions.get(&id) {
                    if entry.state.received() >= max_messages.get() {
                        self.subscriptions.remove(&id);
                    }
                }
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: None,
            } => {
                let _ = self.subscriptions.remove(&id);
            }
            HandlerCommand::Flush { reply } => {
                self.flush_waiters.push_back(reply);
            }
            HandlerCommand::Close(sender) => {
                self.awaiting_close.push(sender);
                self.close_requested = true;
                self.commands.close();
            }
        }
    }

    fn buffer_publish(&mut self, message: Message) {
        match self.pending.push(message) {
            Ok(()) => self.shared.store_pending_bytes(self.pending.bytes()),
            Err(err) => {
                self.shared.record_error(&err);
                let _ = self.events.send(Event::AsyncError(err));
            }
        }
    }

    /// Release the close waiters when the client shuts down without a
    /// live connection.
    pub(crate) fn finish_close(mut self) {
        for waiter in self.awaiting_close.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Publishes buffered while disconnected, bounded by
/// `reconnect_buf_size` bytes of encoded frames
#[derive(Debug)]
pub(crate) struct PendingBuffer {
    messages: Vec<Message>,
    bytes: usize,
    limit: usize,
}

impl PendingBuffer {
    fn new(limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, message: Message) -> Result<(), Error> {
        let frame_len = publish_frame_len(&message);
        if self.bytes + frame_len > self.limit {
            return Err(Error::with_detail(
                ErrorKind::InsufficientBuffer,
                "reconnect buffer is full, publish dropped",
            ));
        }

        self.bytes += frame_len;
        self.messages.push(message);
        Ok(())
    }

    fn bytes(&self) -> usize {
        self.bytes
    }

    fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.bytes = 0;
        self.messages.drain(..)
    }
}

/// The exact number of bytes `PUB <subject> [reply] <len>\r\n<payload>\r\n`
/// occupies on the wire.
pub(crate) fn publish_frame_len(message: &Message) -> usize {
    let mut len = "PUB ".len() + message.subject.len() + " ".len();
    if let Some(reply_subject) = &message.reply_subject {
        len += reply_subject.len() + " ".len();
    }
    len + decimal_len(message.payload.len()) + "\r\n".len() + message.payload.len() + "\r\n".len()
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        digits += 1;
        n /= 10;
    }
    digits
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::{assert_err, assert_ok};
    use rhubarb_proto::{Message, Subject};

    use crate::error::ErrorKind;

    use super::{publish_frame_len, PendingBuffer};

    fn message(payload: &'static [u8]) -> Message {
        Message {
            subject: Subject::from_static("orders.created"),
            reply_subject: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn frame_len_matches_the_encoder() {
        use bytes::Buf as _;
        use rhubarb_proto::proto::{ClientOp, StreamEncoder};

        let messages = [
            message(b""),
            message(b"x"),
            message(b"0123456789"),
            Message {
                subject: Subject::from_static("orders"),
                reply_subject: Some(Subject::from_static("_INBOX.abc.12")),
                payload: Bytes::from_static(b"hello"),
            },
        ];
        for message in messages {
            let mut encoder = StreamEncoder::new();
            encoder.enqueue_write_op(&ClientOp::Publish {
                message: message.clone(),
            });
            assert_eq!(encoder.remaining(), publish_frame_len(&message));
        }
    }

    #[test]
    fn pending_buffer_enforces_its_limit() {
        let small = publish_frame_len(&message(b"hello"));
        let mut pending = PendingBuffer::new(2 * small);

        assert_ok!(pending.push(message(b"hello")));
        assert_ok!(pending.push(message(b"hello")));
        assert_eq!(2 * small, pending.bytes());

        let err = assert_err!(pending.push(message(b"hello")));
        assert_eq!(ErrorKind::InsufficientBuffer, err.kind());
        // The earlier publishes survive
        assert_eq!(2 * small, pending.bytes());
        assert_eq!(2, pending.drain().count());
        assert_eq!(0, pending.bytes());
    }
}
