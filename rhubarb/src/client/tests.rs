use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use claims::{assert_matches, assert_ok};
use rhubarb_proto::{Message, ServerInfo, ServerMessage, StatusCode, Subject, SubscriptionId};
use tokio::sync::mpsc;

use crate::{
    atomic::{AtomicBool, AtomicU64},
    client::{builder::ClientBuilder, create_inbox_subject, state::SharedState, ClientInner},
    error::ErrorKind,
    handler::HandlerCommand,
    subscription::Subscription,
    Client, ConnectionStatus,
};

/// The capture side of [`Client::test`]: receives every command the
/// client would have sent to its connection handler.
#[derive(Debug)]
pub(crate) struct TestHandler {
    pub(crate) receiver: mpsc::Receiver<HandlerCommand>,
    pub(crate) shared: Arc<SharedState>,
}

fn test_server_info() -> ServerInfo {
    ServerInfo {
        id: "TEST".to_owned(),
        name: Some("rhubarb-test".to_owned()),
        version: "2.10.17".to_owned(),
        host: "127.0.0.1".to_owned(),
        port: 4222,
        auth_required: false,
        tls_required: false,
        max_payload: 1024 * 1024,
        protocol_version: 1,
        client_id: Some(1),
        supports_headers: true,
        connect_urls: Vec::new(),
        lame_duck_mode: false,
    }
}

impl Client {
    pub(crate) fn test(client_to_handler_chan_size: usize) -> (Self, TestHandler) {
        Self::test_with(ClientBuilder::new(), client_to_handler_chan_size)
    }

    pub(crate) fn test_with(
        builder: ClientBuilder,
        client_to_handler_chan_size: usize,
    ) -> (Self, TestHandler) {
        let shared = Arc::new(SharedState::new());
        shared.store_status(ConnectionStatus::Connected);
        shared.store_info(Box::new(test_server_info()));

        let (sender, receiver) = mpsc::channel(client_to_handler_chan_size);

        let this = Self {
            inner: Arc::new(ClientInner {
                sender,
                shared: Arc::clone(&shared),
                multiplexed_prefix: create_inbox_subject(&builder.inbox_prefix),
                next_subscription_id: AtomicU64::new(2),
                next_request_id: AtomicU64::new(1),
                inbox_prefix: builder.inbox_prefix.clone(),
                request_timeout: builder.request_timeout,
                use_old_request_style: builder.use_old_request_style,
                max_pending_msgs: builder.max_pending_msgs,
                reconnect_buf_size: builder.reconnect_buf_size,
                flush_in_flight: AtomicBool::new(false),
                driver: tokio::spawn(async {}),
            }),
        };
        let handler = TestHandler { receiver, shared };
        (this, handler)
    }
}

fn delivery(id: SubscriptionId, subject: &str, payload: &'static [u8]) -> ServerMessage {
    ServerMessage {
        status_code: None,
        subscription_id: id,
        message: Message {
            subject: subject.try_into().unwrap(),
            reply_subject: None,
            payload: Bytes::from_static(payload),
        },
    }
}

#[tokio::test]
async fn subscribe_emits_the_subscribe_command() {
    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();

    let HandlerCommand::Subscribe {
        id,
        subject,
        queue_group,
        messages,
        state: _,
    } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Subscribe");
    };
    assert_eq!(SubscriptionId::from(2), id);
    assert_eq!(Subject::from_static("orders.>"), subject);
    assert_eq!(None, queue_group);

    messages
        .try_send(delivery(id, "orders.created", b"Hello World"))
        .unwrap();

    let message = subscription
        .next_message(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!("orders.created", message.subject.as_str());
    assert_eq!(None, message.reply_subject);
    assert_eq!(Bytes::from_static(b"Hello World"), message.payload);
    assert_eq!(0, subscription.queued_messages());
}

#[tokio::test]
async fn queue_subscribe_carries_the_group() {
    let (client, mut handler) = Client::test(4);

    let _subscription = client
        .subscribe(
            Subject::from_static("orders.>"),
            Some("workers".try_into().unwrap()),
        )
        .await
        .unwrap();

    let HandlerCommand::Subscribe { queue_group, .. } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Subscribe");
    };
    assert_eq!(Some("workers".try_into().unwrap()), queue_group);
}

#[tokio::test]
async fn next_message_times_out_when_nothing_arrives() {
    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let _cmd = handler.receiver.try_recv().unwrap();

    let err = subscription
        .next_message(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());
    assert!(subscription.is_valid());
}

#[tokio::test]
async fn slow_consumer_is_reported_once() {
    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let _cmd = handler.receiver.try_recv().unwrap();

    subscription.state().drop_overflow();

    let err = subscription
        .next_message(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::SlowConsumer, err.kind());

    // Self-clearing: the next call goes back to waiting
    let err = subscription
        .next_message(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());
    assert_eq!(1, subscription.stats().dropped);
}

#[tokio::test]
async fn publish_emits_the_message() {
    let (client, mut handler) = Client::test(4);

    client
        .publish(
            Subject::from_static("orders.created"),
            Bytes::from_static(b"Hello World"),
        )
        .await
        .unwrap();

    let HandlerCommand::Publish { message } = handler.receiver.try_recv().unwrap() else {
        panic!("expected Publish");
    };
    assert_eq!("orders.created", message.subject.as_str());
    assert_eq!(None, message.reply_subject);
    assert_eq!(Bytes::from_static(b"Hello World"), message.payload);
}

#[tokio::test]
async fn publish_with_reply_carries_the_reply_subject() {
    let (client, mut handler) = Client::test(4);

    client
        .publish_with_reply(
            Subject::from_static("orders.created"),
            Subject::from_static("_INBOX.abc.1"),
            Bytes::from_static(b"?"),
        )
        .await
        .unwrap();

    let HandlerCommand::Publish { message } = handler.receiver.try_recv().unwrap() else {
        panic!("expected Publish");
    };
    assert_eq!(
        Some(Subject::from_static("_INBOX.abc.1")),
        message.reply_subject
    );
}

#[tokio::test]
async fn oversized_payloads_are_rejected_without_side_effects() {
    let (client, mut handler) = Client::test(4);

    let oversized = Bytes::from(vec![0; 2 * 1024 * 1024]);
    let err = client
        .publish(Subject::from_static("bulk"), oversized)
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::MaxPayload, err.kind());
    assert_eq!(
        ErrorKind::MaxPayload,
        client.last_error().unwrap().kind()
    );
    assert_matches!(
        handler.receiver.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    );

    // The client remains usable
    assert_ok!(
        client
            .publish(Subject::from_static("bulk"), Bytes::from_static(b"ok"))
            .await
    );
    assert_matches!(
        handler.receiver.try_recv(),
        Ok(HandlerCommand::Publish { .. })
    );
}

#[tokio::test]
async fn flush_completes_once_the_handler_answers() {
    let (client, mut handler) = Client::test(4);

    let flush = tokio::spawn({
        let client = client.clone();
        async move { client.flush_timeout(Duration::from_secs(1)).await }
    });

    let HandlerCommand::Flush { reply } = handler.receiver.recv().await.unwrap() else {
        panic!("expected Flush");
    };
    reply.send(()).unwrap();

    assert_ok!(flush.await.unwrap());
}

#[tokio::test]
async fn flush_rejects_zero_timeouts_and_concurrent_calls() {
    let (client, mut handler) = Client::test(4);

    let err = client.flush_timeout(Duration::ZERO).await.unwrap_err();
    assert_eq!(ErrorKind::InvalidArg, err.kind());

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.flush_timeout(Duration::from_secs(1)).await }
    });
    let HandlerCommand::Flush { reply } = handler.receiver.recv().await.unwrap() else {
        panic!("expected Flush");
    };

    // While the first flush is parked, a second one is refused
    let err = client
        .flush_timeout(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::NotPermitted, err.kind());

    reply.send(()).unwrap();
    assert_ok!(first.await.unwrap());

    // And allowed again afterwards
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.flush_timeout(Duration::from_secs(1)).await }
    });
    let HandlerCommand::Flush { reply } = handler.receiver.recv().await.unwrap() else {
        panic!("expected Flush");
    };
    reply.send(()).unwrap();
    assert_ok!(second.await.unwrap());
}

#[tokio::test]
async fn flush_times_out_without_a_pong() {
    let (client, mut handler) = Client::test(4);

    let err = client
        .flush_timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());

    // The handler side still sees the anchor request
    assert_matches!(
        handler.receiver.try_recv(),
        Ok(HandlerCommand::Flush { .. })
    );
}

#[tokio::test]
async fn multiplexed_request_round_trip() {
    let (client, mut handler) = Client::test(4);

    let request = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .request_timeout(
                    Subject::from_static("orders.lookup"),
                    Bytes::from_static(b"?"),
                    Duration::from_secs(1),
                )
                .await
        }
    });

    let HandlerCommand::RequestMultiplexed {
        subject,
        reply_subject,
        payload,
        reply,
    } = handler.receiver.recv().await.unwrap()
    else {
        panic!("expected RequestMultiplexed");
    };
    assert_eq!("orders.lookup", subject.as_str());
    assert_eq!(Bytes::from_static(b"?"), payload);

    reply
        .send(ServerMessage {
            status_code: None,
            subscription_id: SubscriptionId::MIN,
            message: Message {
                subject: reply_subject,
                reply_subject: None,
                payload: Bytes::from_static(b"found"),
            },
        })
        .unwrap();

    let message = request.await.unwrap().unwrap();
    assert_eq!(Bytes::from_static(b"found"), message.payload);
}

#[tokio::test]
async fn request_reports_no_responders() {
    let (client, mut handler) = Client::test(4);

    let request = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .request_timeout(
                    Subject::from_static("orders.lookup"),
                    Bytes::new(),
                    Duration::from_secs(1),
                )
                .await
        }
    });

    let HandlerCommand::RequestMultiplexed {
        reply_subject,
        reply,
        ..
    } = handler.receiver.recv().await.unwrap()
    else {
        panic!("expected RequestMultiplexed");
    };

    reply
        .send(ServerMessage {
            status_code: Some(StatusCode::NO_RESPONDERS),
            subscription_id: SubscriptionId::MIN,
            message: Message {
                subject: reply_subject,
                reply_subject: None,
                payload: Bytes::new(),
            },
        })
        .unwrap();

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(ErrorKind::NoResponders, err.kind());
}

#[tokio::test]
async fn request_times_out_and_releases_the_reply_slot() {
    let (client, mut handler) = Client::test(4);

    let err = client
        .request_timeout(
            Subject::from_static("orders.lookup"),
            Bytes::new(),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());
    assert_eq!(ConnectionStatus::Connected, client.status());

    let _request_cmd = handler.receiver.try_recv().unwrap();
    // Dropping the timed-out response lazily removes the reply slot
    assert_matches!(
        handler.receiver.try_recv(),
        Ok(HandlerCommand::UnsubscribeMultiplexed { .. })
    );
}

#[tokio::test]
async fn old_style_request_uses_a_dedicated_inbox() {
    let (client, mut handler) =
        Client::test_with(ClientBuilder::new().use_old_request_style(true), 8);

    let request = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .request_timeout(
                    Subject::from_static("orders.lookup"),
                    Bytes::from_static(b"?"),
                    Duration::from_secs(1),
                )
                .await
        }
    });

    let HandlerCommand::Subscribe {
        id,
        subject: inbox,
        messages,
        ..
    } = handler.receiver.recv().await.unwrap()
    else {
        panic!("expected Subscribe");
    };
    assert!(inbox.starts_with("_INBOX."));

    let HandlerCommand::Unsubscribe { max_messages, .. } = handler.receiver.recv().await.unwrap()
    else {
        panic!("expected Unsubscribe");
    };
    assert_eq!(Some(1), max_messages.map(u64::from));

    let HandlerCommand::Publish { message } = handler.receiver.recv().await.unwrap() else {
        panic!("expected Publish");
    };
    assert_eq!(Some(inbox.clone()), message.reply_subject);

    messages
        .try_send(delivery(id, inbox.as_str(), b"found"))
        .unwrap();

    let reply = request.await.unwrap().unwrap();
    assert_eq!(Bytes::from_static(b"found"), reply.payload);
}

#[tokio::test]
async fn unsubscribe_is_sent_once() {
    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let _subscribe = handler.receiver.try_recv().unwrap();

    subscription.unsubscribe().await.unwrap();
    let HandlerCommand::Unsubscribe {
        id,
        max_messages: None,
    } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Unsubscribe");
    };
    assert_eq!(SubscriptionId::from(2), id);

    // Unsubscribing again is a NOOP
    subscription.unsubscribe().await.unwrap();
    assert_matches!(
        handler.receiver.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    );

    // Same when dropping the subscription
    drop(subscription);
    assert_matches!(
        handler.receiver.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    );
}

#[tokio::test]
async fn dropping_a_subscription_lazily_unsubscribes() {
    let (client, mut handler) = Client::test(4);

    let subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let _subscribe = handler.receiver.try_recv().unwrap();

    drop(subscription);
    assert_matches!(
        handler.receiver.try_recv(),
        Ok(HandlerCommand::Unsubscribe {
            max_messages: None,
            ..
        })
    );
}

#[tokio::test]
async fn auto_unsubscribe_sets_the_wire_maximum() {
    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let _subscribe = handler.receiver.try_recv().unwrap();

    subscription.auto_unsubscribe(10).await.unwrap();
    let HandlerCommand::Unsubscribe { max_messages, .. } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Unsubscribe");
    };
    assert_eq!(Some(10), max_messages.map(u64::from));
}

#[tokio::test]
async fn next_message_reports_max_messages_delivered() {
    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let HandlerCommand::Subscribe { id, messages, .. } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Subscribe");
    };

    subscription.auto_unsubscribe(1).await.unwrap();
    let _unsubscribe = handler.receiver.try_recv().unwrap();

    // The handler delivers the final message and drops the channel
    messages.try_send(delivery(id, "orders.created", b"1")).unwrap();
    subscription.state().note_received();
    drop(messages);

    assert_ok!(subscription.next_message(Duration::from_secs(1)).await);
    let err = subscription
        .next_message(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::MaxMessagesDelivered, err.kind());
    assert!(!subscription.is_valid());
}

#[tokio::test]
async fn handler_subscriptions_deliver_through_the_callback() {
    let (client, mut handler) = Client::test(4);

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let mut subscription = client
        .subscribe_with(Subject::from_static("orders.>"), None, move |message| {
            delivered_tx.send(message).unwrap();
        })
        .await
        .unwrap();

    let HandlerCommand::Subscribe { id, messages, .. } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Subscribe");
    };

    for payload in [&b"0"[..], b"1", b"2"] {
        messages
            .try_send(delivery(id, "orders.created", payload))
            .unwrap();
    }

    for expected in ["0", "1", "2"] {
        let message = delivered_rx.recv().await.unwrap();
        assert_eq!(expected.as_bytes(), &*message.payload);
    }

    // The control handle cannot consume messages itself
    let err = subscription
        .next_message(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::IllegalState, err.kind());
}

#[tokio::test]
async fn operations_fail_once_the_handler_is_gone() {
    let (client, handler) = Client::test(4);
    drop(handler);

    let err = client
        .publish(Subject::from_static("orders"), Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::ConnectionClosed, err.kind());

    let err = client
        .subscribe(Subject::from_static("orders"), None)
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::ConnectionClosed, err.kind());

    // Closing a dead client is a quiet NOOP
    client.close().await;
}

#[tokio::test]
async fn close_resolves_through_the_handler() {
    let (client, mut handler) = Client::test(4);

    let close = tokio::spawn({
        let client = client.clone();
        async move { client.close().await }
    });

    let HandlerCommand::Close(sender) = handler.receiver.recv().await.unwrap() else {
        panic!("expected Close");
    };
    sender.send(()).unwrap();

    close.await.unwrap();
}

#[tokio::test]
async fn inbox_subjects_are_unique() {
    let prefix = Subject::from_static("_INBOX");
    let a = create_inbox_subject(&prefix);
    let b = create_inbox_subject(&prefix);
    assert_ne!(a, b);
    assert!(a.starts_with("_INBOX."));
}

#[tokio::test]
async fn subscription_stream_yields_messages() {
    use futures_util::StreamExt as _;

    let (client, mut handler) = Client::test(4);

    let mut subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let HandlerCommand::Subscribe { id, messages, .. } = handler.receiver.try_recv().unwrap()
    else {
        panic!("expected Subscribe");
    };

    messages.try_send(delivery(id, "orders.created", b"a")).unwrap();
    messages.try_send(delivery(id, "orders.created", b"b")).unwrap();
    drop(messages);

    assert_eq!(
        Bytes::from_static(b"a"),
        subscription.next().await.unwrap().payload
    );
    assert_eq!(
        Bytes::from_static(b"b"),
        subscription.next().await.unwrap().payload
    );
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn subscribe_is_cancel_safe() {
    use std::{future::Future, pin::pin, task::Context};

    use futures_util::task::noop_waker_ref;

    let (client, mut handler) = Client::test(1);

    let _subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();

    {
        // The channel is full, so this subscribe parks on the reserve
        let subscribe_future = pin!(client.subscribe(Subject::from_static("other.>"), None));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(subscribe_future.poll(&mut cx).is_pending());
    }

    let HandlerCommand::Subscribe { id, .. } = handler.receiver.recv().await.unwrap() else {
        panic!("expected Subscribe");
    };
    assert_eq!(SubscriptionId::from(2), id);

    // The cancelled attempt did not burn a subscription id or leave a
    // stray command behind
    let _subscription2: Subscription = client
        .subscribe(Subject::from_static("orders.>"), None)
        .await
        .unwrap();
    let HandlerCommand::Subscribe { id, .. } = handler.receiver.recv().await.unwrap() else {
        panic!("expected Subscribe");
    };
    assert_eq!(SubscriptionId::from(3), id);
}
