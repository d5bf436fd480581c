use std::{
    future::{self, Future},
    io,
    pin::{pin, Pin},
    task::{Context, Poll},
};

use bytes::Buf;
use rhubarb_proto::proto::{error::DecoderError, ClientOp, ServerOp, StreamDecoder, StreamEncoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Stop accepting new write ops once this many bytes are already queued
const OUTGOING_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

/// A framed protocol connection over any byte stream
///
/// Pairs a [`StreamDecoder`] and a [`StreamEncoder`] around a socket.
/// This is the transport seam of the client: `S` only needs to implement
/// [`AsyncRead`] and [`AsyncWrite`], so the same connection drives plain
/// TCP, TLS, or an in-memory duplex in tests.
#[derive(Debug)]
pub struct StreamingConnection<S> {
    socket: S,
    encoder: StreamEncoder,
    decoder: StreamDecoder,
    may_flush: bool,
}

impl<S> StreamingConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            encoder: StreamEncoder::new(),
            decoder: StreamDecoder::new(),
            may_flush: false,
        }
    }

    pub fn poll_read_next(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ServerOp, StreamingReadError>> {
        loop {
            match self.decoder.decode() {
                Ok(Some(server_op)) => return Poll::Ready(Ok(server_op)),
                Ok(None) => {}
                Err(err) => return Poll::Ready(Err(StreamingReadError::Decoder(err))),
            }

            let read_buf_fut = pin!(self.socket.read_buf(self.decoder.read_buf()));
            match read_buf_fut.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(1..)) => {}
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(StreamingReadError::Io(
                        io::ErrorKind::UnexpectedEof.into(),
                    )))
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(StreamingReadError::Io(err))),
            }
        }
    }

    /// Read the next [`ServerOp`].
    ///
    /// # Errors
    ///
    /// It returns an error if the stream cannot be decoded or if an I/O
    /// error occurs.
    pub async fn read_next(&mut self) -> Result<ServerOp, StreamingReadError> {
        future::poll_fn(|cx| self.poll_read_next(cx)).await
    }

    /// Whether queued frame bytes are waiting to be written
    pub fn may_write(&self) -> bool {
        self.encoder.has_remaining()
    }

    /// Whether written bytes may be sitting in the socket's own buffers
    pub fn may_flush(&self) -> bool {
        self.may_flush
    }

    /// Whether the outgoing buffer has room for more frames
    pub fn may_enqueue_more_ops(&self) -> bool {
        self.encoder.remaining() < OUTGOING_BUFFER_LIMIT
    }

    pub fn enqueue_write_op(&mut self, item: &ClientOp) {
        self.encoder.enqueue_write_op(item);
    }

    pub fn poll_write_next(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if !self.encoder.has_remaining() {
            return Poll::Ready(Ok(0));
        }

        let write_outcome = if self.socket.is_write_vectored() {
            let mut bufs = [io::IoSlice::new(&[]); 64];
            let n = self.encoder.chunks_vectored(&mut bufs);
            debug_assert!(n > 0);

            Pin::new(&mut self.socket).poll_write_vectored(cx, &bufs[..n])
        } else {
            Pin::new(&mut self.socket).poll_write(cx, self.encoder.chunk())
        };

        match write_outcome {
            Poll::Pending => {
                self.may_flush = false;
                Poll::Pending
            }
            Poll::Ready(Ok(n)) => {
                self.encoder.advance(n);
                self.may_flush = true;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }

    /// Write the next chunk of queued frames to the socket, returning the
    /// number of bytes written.
    ///
    /// # Errors
    ///
    /// An I/O error is returned if the socket write fails.
    pub async fn write_next(&mut self) -> io::Result<usize> {
        future::poll_fn(|cx| self.poll_write_next(cx)).await
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.socket).poll_flush(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                self.may_flush = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }

    /// Flush the socket's buffered writes.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub async fn flush(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Write out every queued frame and flush.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or flushing fails.
    pub async fn write_and_flush(&mut self) -> io::Result<()> {
        while self.may_write() {
            self.write_next().await?;
        }
        self.flush().await
    }

    /// Shut down the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails; callers tearing the
    /// connection down usually ignore it.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| Pin::new(&mut self.socket).poll_shutdown(cx)).await
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn into_inner(self) -> S {
        self.socket
    }
}

/// An error encountered while reading from the connection
#[derive(Debug, thiserror::Error)]
pub enum StreamingReadError {
    #[error("decoder")]
    Decoder(#[source] DecoderError),
    #[error("io")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use claims::assert_matches;
    use futures_util::task;
    use rhubarb_proto::proto::{ClientOp, ServerOp};
    use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};

    use super::StreamingConnection;

    #[test]
    fn ping_pong() {
        let waker = task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let (socket, mut server) = io::duplex(1024);

        let mut client = StreamingConnection::new(socket);

        // Nothing to read or write yet
        assert!(client.poll_read_next(&mut cx).is_pending());
        assert_matches!(client.poll_write_next(&mut cx), Poll::Ready(Ok(0)));

        let mut buf = [0; 1024];
        let mut read_buf = ReadBuf::new(&mut buf);
        assert!(Pin::new(&mut server)
            .poll_read(&mut cx, &mut read_buf)
            .is_pending());

        // PING reaches the other end
        client.enqueue_write_op(&ClientOp::Ping);
        assert!(client.may_write());
        assert_matches!(client.poll_write_next(&mut cx), Poll::Ready(Ok(6)));
        assert_matches!(
            Pin::new(&mut server).poll_read(&mut cx, &mut read_buf),
            Poll::Ready(Ok(()))
        );
        assert_eq!(read_buf.filled(), b"PING\r\n");

        // PONG comes back
        assert_matches!(
            Pin::new(&mut server).poll_write(&mut cx, b"PONG\r\n"),
            Poll::Ready(Ok(6))
        );
        assert_matches!(
            client.poll_read_next(&mut cx),
            Poll::Ready(Ok(ServerOp::Pong))
        );
        assert!(client.poll_read_next(&mut cx).is_pending());
    }

    #[tokio::test]
    async fn detects_clean_eof_as_error() {
        let (socket, server) = io::duplex(64);
        let mut client = StreamingConnection::new(socket);

        drop(server);
        assert_matches!(
            client.read_next().await,
            Err(super::StreamingReadError::Io(_))
        );
    }
}
