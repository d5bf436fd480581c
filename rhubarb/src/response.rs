use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use rhubarb_proto::{Message, ServerMessage, StatusCode, Subject};
use tokio::{
    sync::oneshot,
    time::{sleep, Sleep},
};

use crate::{
    client::Client,
    error::{Error, ErrorKind},
    subscription::Subscription,
};

/// A pending reply routed through the shared reply subscription
///
/// Dropping it before completion lazily removes the reply slot from the
/// connection's request map.
#[derive(Debug)]
pub(crate) struct MultiplexedRequest {
    inner: Option<MultiplexedRequestInner>,
}

#[derive(Debug)]
struct MultiplexedRequestInner {
    reply_subject: Subject,
    receiver: oneshot::Receiver<ServerMessage>,
    client: Client,
}

impl MultiplexedRequest {
    pub(crate) fn new(
        reply_subject: Subject,
        receiver: oneshot::Receiver<ServerMessage>,
        client: Client,
    ) -> Self {
        Self {
            inner: Some(MultiplexedRequestInner {
                reply_subject,
                receiver,
                client,
            }),
        }
    }
}

impl Future for MultiplexedRequest {
    type Output = Result<ServerMessage, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self
            .inner
            .as_mut()
            .expect("MultiplexedRequest polled after completion");

        match Pin::new(&mut inner.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.inner = None;
                Poll::Ready(result.map_err(|_| Error::new(ErrorKind::ConnectionClosed)))
            }
        }
    }
}

impl Drop for MultiplexedRequest {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        inner
            .client
            .lazy_unsubscribe_multiplexed(inner.reply_subject);
    }
}

pin_project! {
    /// A [`Future`] resolving to the reply of a request
    #[derive(Debug)]
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub(crate) struct ResponseFut {
        kind: ResponseKind,
        #[pin]
        deadline: Sleep,
    }
}

#[derive(Debug)]
enum ResponseKind {
    Multiplexed(MultiplexedRequest),
    /// The old request style: a dedicated single-reply subscription
    Subscription(Subscription),
}

impl ResponseFut {
    pub(crate) fn multiplexed(request: MultiplexedRequest, timeout: Duration) -> Self {
        Self {
            kind: ResponseKind::Multiplexed(request),
            deadline: sleep(timeout),
        }
    }

    pub(crate) fn subscription(subscription: Subscription, timeout: Duration) -> Self {
        Self {
            kind: ResponseKind::Subscription(subscription),
            deadline: sleep(timeout),
        }
    }
}

impl Future for ResponseFut {
    type Output = Result<Message, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let reply = match this.kind {
            ResponseKind::Multiplexed(request) => match Pin::new(request).poll(cx) {
                Poll::Pending => None,
                Poll::Ready(Ok(reply)) => Some(reply),
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            },
            ResponseKind::Subscription(subscription) => match subscription.poll_recv(cx) {
                Poll::Pending => None,
                Poll::Ready(Some(reply)) => Some(reply),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(Error::new(ErrorKind::ConnectionClosed)))
                }
            },
        };

        match reply {
            Some(reply) if reply.status_code == Some(StatusCode::NO_RESPONDERS) => {
                Poll::Ready(Err(Error::new(ErrorKind::NoResponders)))
            }
            Some(reply) => Poll::Ready(Ok(reply.message)),
            None => match this.deadline.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => Poll::Ready(Err(Error::new(ErrorKind::Timeout))),
            },
        }
    }
}
