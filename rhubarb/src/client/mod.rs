use std::{fmt::Write as _, num::NonZeroU64, sync::Arc, time::Duration};

use bytes::Bytes;
use rand::RngCore;
use rhubarb_net::Connector;
use rhubarb_proto::{Message, QueueGroup, ServerInfo, Subject, SubscriptionId};
use tokio::{
    sync::{
        mpsc::{self, Permit},
        oneshot,
    },
    task::JoinHandle,
    time::{self, Instant},
};

pub use self::builder::{Auth, ClientBuilder};
pub use self::state::{ClientStatistics, ConnectionStatus};
pub(crate) use self::state::SharedState;
use crate::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    error::{Error, ErrorKind},
    events::{dispatch_events, Event},
    handler::{
        publish_frame_len, Handler, HandlerCommand, HandlerOutput, RecycledHandler,
        MULTIPLEXED_SUBSCRIPTION_ID,
    },
    pool::ServerPool,
    response::{MultiplexedRequest, ResponseFut},
    subscription::{Subscription, SubscriptionState},
};

pub(crate) mod builder;
pub(crate) mod state;
#[cfg(test)]
pub(crate) mod tests;

#[cfg(feature = "from-env")]
pub(super) mod from_env;

const CLIENT_OP_CHANNEL_SIZE: usize = 512;
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// A client for a NATS server or cluster
///
/// `Client` is a `Clone`able handle to one connection. The connection is
/// driven by a background task which, when the connection is lost,
/// walks the server pool until it can reconnect, re-issues every open
/// subscription and replays publishes buffered in the meantime.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sender: mpsc::Sender<HandlerCommand>,
    shared: Arc<SharedState>,
    multiplexed_prefix: Subject,
    next_subscription_id: AtomicU64,
    next_request_id: AtomicU64,
    inbox_prefix: Subject,
    request_timeout: Duration,
    use_old_request_style: bool,
    max_pending_msgs: usize,
    reconnect_buf_size: usize,
    flush_in_flight: AtomicBool,
    driver: JoinHandle<()>,
}

impl Client {
    /// Configure a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to the given URL with the default configuration.
    ///
    /// # Errors
    ///
    /// It returns an error if the URL cannot be parsed or the connection
    /// fails.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let addr = url
            .parse()
            .map_err(|err: rhubarb_proto::error::ServerAddrError| {
                Error::with_detail(ErrorKind::InvalidArg, err.to_string())
            })?;
        Self::builder().connect_to(addr).await
    }

    pub(crate) async fn connect_with(mut builder: ClientBuilder) -> Result<Self, Error> {
        let mut pool = ServerPool::new(builder.pool_addrs(), builder.no_randomize);
        let connector = Connector::new();
        let shared = Arc::new(SharedState::new());
        let (sender, receiver) = mpsc::channel(CLIENT_OP_CHANNEL_SIZE);
        let (events, events_rx) = mpsc::unbounded_channel();

        let callbacks = std::mem::take(&mut builder.callbacks);
        tokio::spawn(dispatch_events(events_rx, callbacks));

        shared.store_status(ConnectionStatus::Connecting);
        let recycle =
            RecycledHandler::new(receiver, Arc::clone(&shared), events.clone(), &builder);
        let multiplexed_prefix = recycle.multiplexed_prefix().clone();

        let handle = match initial_connect(&connector, &mut pool, &builder, recycle).await {
            Ok(handle) => handle,
            Err(err) => {
                shared.store_status(ConnectionStatus::Closed);
                shared.record_error(&err);
                let _ = events.send(Event::Closed);
                return Err(err);
            }
        };
        let _ = events.send(Event::Connected);

        let inner = ClientInner {
            sender,
            shared: Arc::clone(&shared),
            multiplexed_prefix,
            next_subscription_id: AtomicU64::new(u64::from(MULTIPLEXED_SUBSCRIPTION_ID) + 1),
            next_request_id: AtomicU64::new(1),
            inbox_prefix: builder.inbox_prefix.clone(),
            request_timeout: builder.request_timeout,
            use_old_request_style: builder.use_old_request_style,
            max_pending_msgs: builder.max_pending_msgs,
            reconnect_buf_size: builder.reconnect_buf_size,
            flush_in_flight: AtomicBool::new(false),
            driver: tokio::spawn(drive(handle, connector, pool, builder, shared, events)),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Publish `payload` on `subject`.
    ///
    /// A successful return means the message has at least been buffered;
    /// a subsequent successful [`Client::flush`] means the server has
    /// received it.
    ///
    /// # Errors
    ///
    /// It returns an error if the payload exceeds the server's maximum,
    /// if the reconnect buffer is full, or if the client is closed.
    pub async fn publish(&self, subject: Subject, payload: Bytes) -> Result<(), Error> {
        self.do_publish(Message {
            subject,
            reply_subject: None,
            payload,
        })
        .await
    }

    /// Publish `payload` on `subject`, asking replies to be sent to
    /// `reply_subject`.
    ///
    /// # Errors
    ///
    /// See [`Client::publish`].
    pub async fn publish_with_reply(
        &self,
        subject: Subject,
        reply_subject: Subject,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.do_publish(Message {
            subject,
            reply_subject: Some(reply_subject),
            payload,
        })
        .await
    }

    async fn do_publish(&self, message: Message) -> Result<(), Error> {
        self.check_payload(message.payload.len())?;
        self.check_reconnect_buffer(&message)?;
        self.enqueue_command(HandlerCommand::Publish { message })
            .await
    }

    /// Publish a request and wait for its reply, up to the configured
    /// default request timeout.
    ///
    /// # Errors
    ///
    /// Besides the publish errors, it fails with `ErrorKind::Timeout`
    /// when no reply arrives in time and `ErrorKind::NoResponders` when
    /// the server knows of no subscriber for `subject`.
    pub async fn request(&self, subject: Subject, payload: Bytes) -> Result<Message, Error> {
        self.request_timeout(subject, payload, self.inner.request_timeout)
            .await
    }

    /// Publish a request and wait for its reply, up to `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn request_timeout(
        &self,
        subject: Subject,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.check_payload(payload.len())?;

        let response = if self.inner.use_old_request_style {
            self.old_style_request(subject, payload, timeout).await?
        } else {
            self.multiplexed_request(subject, payload, timeout).await?
        };

        let result = response.await;
        if let Err(err) = &result {
            self.inner.shared.record_error(err);
        }
        result
    }

    async fn multiplexed_request(
        &self,
        subject: Subject,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<ResponseFut, Error> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| self.closed_error())?;

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::AcqRel);
        let mut reply_subject = String::with_capacity(self.inner.multiplexed_prefix.len() + 21);
        write!(
            &mut reply_subject,
            "{}.{request_id}",
            self.inner.multiplexed_prefix
        )
        .expect("write to String");
        let reply_subject = Subject::from_dangerous_value(reply_subject.into());

        let (sender, receiver) = oneshot::channel();
        permit.send(HandlerCommand::RequestMultiplexed {
            subject,
            reply_subject: reply_subject.clone(),
            payload,
            reply: sender,
        });

        Ok(ResponseFut::multiplexed(
            MultiplexedRequest::new(reply_subject, receiver, self.clone()),
            timeout,
        ))
    }

    async fn old_style_request(
        &self,
        subject: Subject,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<ResponseFut, Error> {
        let inbox = create_inbox_subject(&self.inner.inbox_prefix);
        let mut subscription = self.subscribe(inbox.clone(), None).await?;
        subscription.auto_unsubscribe(1).await?;
        self.publish_with_reply(subject, inbox, payload).await?;

        Ok(ResponseFut::subscription(subscription, timeout))
    }

    /// Subscribe to `subject`, optionally as part of a queue group.
    ///
    /// Messages are read off the returned [`Subscription`] with
    /// [`Subscription::next_message`] or through its `Stream`
    /// implementation.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn subscribe(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, Error> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| self.closed_error())?;

        Ok(self.do_subscribe(permit, subject, queue_group))
    }

    /// Subscribe to `subject` and deliver every message to `handler` on
    /// a dedicated task.
    ///
    /// The returned [`Subscription`] only controls the subscription's
    /// lifecycle; calling [`Subscription::next_message`] on it fails
    /// with `ErrorKind::IllegalState`.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn subscribe_with<F>(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        mut handler: F,
    ) -> Result<Subscription, Error>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut subscription = self.subscribe(subject, queue_group).await?;

        if let Some(mut receiver) = subscription.take_receiver() {
            let state = Arc::clone(subscription.state());
            tokio::spawn(async move {
                while let Some(server_message) = receiver.recv().await {
                    state.note_delivered(server_message.message.payload.len());
                    handler(server_message.message);
                }
            });
        }

        Ok(subscription)
    }

    fn do_subscribe(
        &self,
        permit: Permit<'_, HandlerCommand>,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Subscription {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        let state = Arc::new(SubscriptionState::new(self.inner.max_pending_msgs));
        let (sender, receiver) = mpsc::channel(self.inner.max_pending_msgs);

        permit.send(HandlerCommand::Subscribe {
            id,
            subject: subject.clone(),
            queue_group,
            messages: sender,
            state: Arc::clone(&state),
        });
        Subscription::new(id, subject, self.clone(), receiver, state)
    }

    /// Flush buffered writes and wait for the server to acknowledge
    /// them, up to 10 seconds.
    ///
    /// # Errors
    ///
    /// See [`Client::flush_timeout`].
    pub async fn flush(&self) -> Result<(), Error> {
        self.flush_timeout(DEFAULT_FLUSH_TIMEOUT).await
    }

    /// Flush buffered writes and wait for the server to acknowledge
    /// them, up to `timeout`.
    ///
    /// The wait piggybacks on a `PING`/`PONG` round trip: once the
    /// matching `PONG` arrives, everything written before the flush has
    /// been received by the server.
    ///
    /// Only one flush may be in flight per client.
    ///
    /// # Errors
    ///
    /// * `ErrorKind::InvalidArg` for a zero timeout
    /// * `ErrorKind::NotPermitted` if another flush is in flight
    /// * `ErrorKind::Timeout` if the deadline expired
    /// * `ErrorKind::ConnectionClosed` if the client closed meanwhile
    pub async fn flush_timeout(&self, timeout: Duration) -> Result<(), Error> {
        if timeout.is_zero() {
            let err = Error::with_detail(
                ErrorKind::InvalidArg,
                "flush timeout must be greater than zero",
            );
            self.inner.shared.record_error(&err);
            return Err(err);
        }

        if self.inner.flush_in_flight.swap(true, Ordering::AcqRel) {
            let err =
                Error::with_detail(ErrorKind::NotPermitted, "another flush is in flight");
            self.inner.shared.record_error(&err);
            return Err(err);
        }
        let _reset = FlushReset(&self.inner.flush_in_flight);

        let (sender, receiver) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Flush { reply: sender })
            .await?;

        let result = match time::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_recv)) => Err(self.closed_error()),
            Err(_elapsed) => Err(Error::new(ErrorKind::Timeout)),
        };
        if let Err(err) = &result {
            self.inner.shared.record_error(err);
        }
        result
    }

    /// Close the client, flushing buffered messages first.
    ///
    /// Safe to call from multiple tasks; the closed callback fires
    /// exactly once. Calling it on an already closed client is a NOOP.
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        if self
            .enqueue_command(HandlerCommand::Close(sender))
            .await
            .is_err()
        {
            return;
        }

        let _ = receiver.await;
    }

    /// The current lifecycle status
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.shared.status()
    }

    /// Whether the client is permanently closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    /// Whether the client is currently trying to reconnect
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.status() == ConnectionStatus::Reconnecting
    }

    /// A snapshot of the connection counters
    #[must_use]
    pub fn stats(&self) -> ClientStatistics {
        self.inner.shared.stats()
    }

    /// The most recent error recorded by the client
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.inner.shared.last_error()
    }

    /// The latest `INFO` document received from the server
    #[must_use]
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner
            .shared
            .server_info()
            .expect("a connected client always has server info")
    }

    pub(crate) async fn unsubscribe(
        &self,
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    ) -> Result<(), Error> {
        self.enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, id: SubscriptionId, max_messages: Option<NonZeroU64>) {
        let _ = self
            .inner
            .sender
            .try_send(HandlerCommand::Unsubscribe { id, max_messages });
    }

    pub(crate) fn lazy_unsubscribe_multiplexed(&self, reply_subject: Subject) {
        let _ = self
            .inner
            .sender
            .try_send(HandlerCommand::UnsubscribeMultiplexed { reply_subject });
    }

    async fn enqueue_command(&self, cmd: HandlerCommand) -> Result<(), Error> {
        self.inner
            .sender
            .send(cmd)
            .await
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> Error {
        let err = Error::new(ErrorKind::ConnectionClosed);
        self.inner.shared.record_error(&err);
        err
    }

    fn check_payload(&self, payload_len: usize) -> Result<(), Error> {
        if let Some(info) = self.inner.shared.server_info() {
            if payload_len as u64 > info.max_payload {
                let err = Error::with_detail(
                    ErrorKind::MaxPayload,
                    format!(
                        "payload of {payload_len} bytes exceeds the server limit of {}",
                        info.max_payload
                    ),
                );
                self.inner.shared.record_error(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Fail fast when a publish cannot fit the reconnect pending buffer.
    /// The handler enforces the same cap authoritatively.
    fn check_reconnect_buffer(&self, message: &Message) -> Result<(), Error> {
        if self.status() != ConnectionStatus::Reconnecting {
            return Ok(());
        }

        let frame_len = publish_frame_len(message);
        if self.inner.shared.pending_bytes() + frame_len > self.inner.reconnect_buf_size {
            let err = Error::with_detail(
                ErrorKind::InsufficientBuffer,
                "reconnect buffer is full, publish rejected",
            );
            self.inner.shared.record_error(&err);
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct FlushReset<'a>(&'a AtomicBool);

impl Drop for FlushReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Walk the pool once, trying to establish the initial connection.
async fn initial_connect(
    connector: &Connector,
    pool: &mut ServerPool,
    builder: &ClientBuilder,
    mut recycle: RecycledHandler,
) -> Result<Handler, Error> {
    let mut last_err = None;

    for _ in 0..pool.len() {
        let server = pool.current_mut().expect("pool is never empty here");
        server.last_attempt = Some(Instant::now());
        let addr = server.addr.clone();

        match Handler::connect(connector, &addr, builder, recycle).await {
            Ok(handle) => {
                pool.note_connected();
                return Ok(handle);
            }
            Err((err, prev_recycle)) => {
                recycle = prev_recycle;
                last_err = Some(err);
                pool.rotate();
            }
        }
    }

    Err(match last_err {
        Some(err)
            if matches!(
                err.kind(),
                ErrorKind::Auth | ErrorKind::SecureConnectionRequired
            ) =>
        {
            err
        }
        Some(err) => Error::with_detail(ErrorKind::NoServers, err.to_string()),
        None => Error::new(ErrorKind::NoServers),
    })
}

/// Walk the pool until a reconnect succeeds or the pool is exhausted.
///
/// Commands issued by the application keep being absorbed while
/// sleeping between attempts.
async fn reconnect_loop(
    connector: &Connector,
    pool: &mut ServerPool,
    builder: &ClientBuilder,
    mut recycle: RecycledHandler,
    shared: &SharedState,
) -> Result<Handler, RecycledHandler> {
    loop {
        if recycle.close_requested() || !pool.next(builder.max_reconnect) {
            return Err(recycle);
        }

        let server = pool.current_mut().expect("next returned true");
        if let Some(last_attempt) = server.last_attempt {
            let since = last_attempt.elapsed();
            if since < builder.reconnect_wait {
                recycle.idle_for(builder.reconnect_wait - since).await;
                if recycle.close_requested() {
                    return Err(recycle);
                }
            }
        }

        let server = pool.current_mut().expect("pool is non-empty");
        server.last_attempt = Some(Instant::now());
        server.reconnects += 1;
        let addr = server.addr.clone();

        match Handler::connect(connector, &addr, builder, recycle).await {
            Ok(handle) => {
                pool.note_connected();
                return Ok(handle);
            }
            Err((err, prev_recycle)) => {
                shared.record_error(&err);
                recycle = prev_recycle;
            }
        }
    }
}

/// Drive the connection until it closes, reconnecting as needed.
async fn drive(
    mut handle: Handler,
    connector: Connector,
    mut pool: ServerPool,
    builder: ClientBuilder,
    shared: Arc<SharedState>,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        match (&mut handle).await {
            HandlerOutput::Disconnected => {
                let recycle = handle.recycle().await;

                if !builder.allow_reconnect || recycle.close_requested() {
                    let _ = events.send(Event::Disconnected);
                    close_without_connection(recycle, &shared, &events);
                    break;
                }

                shared.store_status(ConnectionStatus::Reconnecting);
                let _ = events.send(Event::Disconnected);

                match reconnect_loop(&connector, &mut pool, &builder, recycle, &shared).await {
                    Ok(new_handle) => {
                        handle = new_handle;
                        shared.record_reconnect();
                        let _ = events.send(Event::Reconnected);
                    }
                    Err(recycle) => {
                        if !recycle.close_requested() {
                            shared.record_error(&Error::new(ErrorKind::NoServers));
                        }
                        close_without_connection(recycle, &shared, &events);
                        break;
                    }
                }
            }
            HandlerOutput::ServerError => {
                // The server rejected us with a fatal `-ERR`
                let recycle = handle.recycle().await;
                let _ = events.send(Event::Disconnected);
                close_without_connection(recycle, &shared, &events);
                break;
            }
            HandlerOutput::Closed => {
                let _ = events.send(Event::Disconnected);
                handle.finish_close().await;
                shared.store_status(ConnectionStatus::Closed);
                let _ = events.send(Event::Closed);
                break;
            }
        }
    }
}

fn close_without_connection(
    recycle: RecycledHandler,
    shared: &SharedState,
    events: &mpsc::UnboundedSender<Event>,
) {
    shared.store_status(ConnectionStatus::Closed);
    recycle.finish_close();
    let _ = events.send(Event::Closed);
}

/// Generate a fresh, effectively unique inbox subject under `prefix`.
pub(crate) fn create_inbox_subject(prefix: &Subject) -> Subject {
    let mut suffix = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut suffix);

    let mut subject = String::with_capacity(prefix.len() + ".".len() + (suffix.len() * 2));
    write!(
        &mut subject,
        "{}.{:032x}",
        prefix,
        u128::from_ne_bytes(suffix)
    )
    .expect("write to String");

    Subject::from_dangerous_value(subject.into())
}
