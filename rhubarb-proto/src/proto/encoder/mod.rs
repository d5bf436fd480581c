use core::fmt::{self, Write as _};
#[cfg(feature = "std")]
use std::io;

use bytes::Bytes;

use crate::Message;

pub use self::stream::StreamEncoder;

use super::ClientOp;

mod stream;

/// Sink for the frame encoder
///
/// `put_small` is for short protocol text that is copied into a
/// contiguous buffer; `put_payload` may keep large application payloads
/// as separate chunks for vectored writes.
pub(super) trait WriteFrame {
    fn put_small(&mut self, buf: &[u8]);

    fn put_payload<B>(&mut self, buf: B)
    where
        B: Into<Bytes> + AsRef<[u8]>,
    {
        self.put_small(buf.as_ref());
    }

    fn fmt_writer(&mut self) -> FrameFmtWriter<'_, Self> {
        FrameFmtWriter(self)
    }

    #[cfg(feature = "std")]
    fn io_writer(&mut self) -> FrameIoWriter<'_, Self> {
        FrameIoWriter(self)
    }
}

pub(super) struct FrameFmtWriter<'a, E: ?Sized>(&'a mut E);

impl<E> fmt::Write for FrameFmtWriter<'_, E>
where
    E: WriteFrame,
{
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_small(s.as_bytes());
        Ok(())
    }
}

#[cfg(feature = "std")]
pub(super) struct FrameIoWriter<'a, E: ?Sized>(&'a mut E);

#[cfg(feature = "std")]
impl<E> io::Write for FrameIoWriter<'_, E>
where
    E: WriteFrame,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_small(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.put_small(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(super) fn encode<E: WriteFrame>(encoder: &mut E, item: &ClientOp) {
    macro_rules! put_text {
        ($dst:expr) => {
            write!(encoder.fmt_writer(), $dst).expect("write frame text")
        };
    }

    match item {
        ClientOp::Publish { message } => {
            let Message {
                subject,
                reply_subject,
                payload,
            } = &message;

            put_text!("PUB {subject} ");
            if let Some(reply_subject) = reply_subject {
                put_text!("{reply_subject} ");
            }
            let payload_len = payload.len();
            put_text!("{payload_len}\r\n");

            encoder.put_payload(CloneBytes(payload));
            encoder.put_small(b"\r\n");
        }
        ClientOp::Subscribe {
            id,
            subject,
            queue_group,
        } => match queue_group {
            Some(queue_group) => put_text!("SUB {subject} {queue_group} {id}\r\n"),
            None => put_text!("SUB {subject} {id}\r\n"),
        },
        ClientOp::Unsubscribe { id, max_messages } => match max_messages {
            Some(max_messages) => put_text!("UNSUB {id} {max_messages}\r\n"),
            None => put_text!("UNSUB {id}\r\n"),
        },
        ClientOp::Connect { connect } => {
            encoder.put_small(b"CONNECT ");
            #[cfg(feature = "std")]
            serde_json::to_writer(encoder.io_writer(), &connect).expect("serialize `Connect`");
            #[cfg(not(feature = "std"))]
            encoder.put_payload(serde_json::to_vec(&connect).expect("serialize `Connect`"));
            encoder.put_small(b"\r\n");
        }
        ClientOp::Ping => encoder.put_small(b"PING\r\n"),
        ClientOp::Pong => encoder.put_small(b"PONG\r\n"),
    }
}

struct CloneBytes<'a>(&'a Bytes);

impl<'a> From<CloneBytes<'a>> for Bytes {
    fn from(value: CloneBytes<'a>) -> Self {
        Bytes::clone(value.0)
    }
}

impl AsRef<[u8]> for CloneBytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}
