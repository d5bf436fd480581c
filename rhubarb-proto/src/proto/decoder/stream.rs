use bytes::{BufMut, BytesMut};

use crate::proto::{error::DecoderError, ServerOp};

use super::{decode, DecodeState};

const INITIAL_READ_BUF_CAPACITY: usize = 32 * 1024;

/// An incremental decoder for a raw byte stream
///
/// Bytes are appended into [`StreamDecoder::read_buf`] as they arrive
/// from the transport; [`StreamDecoder::decode`] turns them into
/// [`ServerOp`]s, yielding `None` whenever a frame is still incomplete.
#[derive(Debug)]
pub struct StreamDecoder {
    read_buf: BytesMut,
    state: DecodeState,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(INITIAL_READ_BUF_CAPACITY),
            state: DecodeState::initial(),
        }
    }

    #[must_use]
    pub fn read_buf(&mut self) -> &mut impl BufMut {
        &mut self.read_buf
    }

    /// Decode the next [`ServerOp`] out of the buffered bytes.
    ///
    /// Returns `None` when no complete frame is available yet.
    ///
    /// # Errors
    ///
    /// It returns an error if the byte stream violates the protocol.
    /// The decoder must not be used afterwards.
    pub fn decode(&mut self) -> Result<Option<ServerOp>, DecoderError> {
        decode(&mut self.state, &mut self.read_buf)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, Bytes};
    use claims::{assert_err, assert_ok_eq};

    use crate::{
        error::ServerError,
        message::{Message, ServerMessage},
        proto::ServerOp,
        StatusCode, Subject,
    };

    use super::StreamDecoder;

    #[test]
    fn decodes_heartbeat_frames() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"PING\r\nPONG\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Pong));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn operation_names_are_case_insensitive() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"ping\r\n+ok\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Success));
    }

    #[test]
    fn decodes_ok_and_err() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"+OK\r\n-ERR 'Stale Connection'\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Success));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Error {
                error: ServerError::StaleConnection
            })
        );
    }

    #[test]
    fn decodes_info() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"INFO {\"server_id\":\"abc\",\"version\":\"2.10.0\",\"max_payload\":65536}\r\n",
        ));
        let Some(ServerOp::Info { info }) = decoder.decode().unwrap() else {
            panic!("expected INFO");
        };
        assert_eq!("abc", info.id);
        assert_eq!(65536, info.max_payload);
    }

    #[test]
    fn decodes_msg() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"MSG orders.created 9 11\r\nHello World\r\n",
        ));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Message {
                message: ServerMessage {
                    status_code: None,
                    subscription_id: 9.into(),
                    message: Message {
                        subject: Subject::from_static("orders.created"),
                        reply_subject: None,
                        payload: Bytes::from_static(b"Hello World"),
                    }
                }
            })
        );
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decodes_msg_with_reply_subject() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"MSG orders.created 9 _INBOX.abc.1 2\r\nok\r\n",
        ));
        let Some(ServerOp::Message { message }) = decoder.decode().unwrap() else {
            panic!("expected MSG");
        };
        assert_eq!(
            Some(Subject::from_static("_INBOX.abc.1")),
            message.message.reply_subject
        );
    }

    #[test]
    fn decodes_msg_split_across_arbitrary_chunks() {
        let frame = b"MSG orders.created 9 11\r\nHello World\r\nPING\r\n";
        for split in 1..frame.len() {
            let mut decoder = StreamDecoder::new();
            decoder.read_buf().put(&frame[..split]);

            let mut ops = alloc::vec::Vec::new();
            while let Some(op) = decoder.decode().unwrap() {
                ops.push(op);
            }
            decoder.read_buf().put(&frame[split..]);
            while let Some(op) = decoder.decode().unwrap() {
                ops.push(op);
            }

            assert_eq!(2, ops.len(), "split at {split}");
            claims::assert_matches!(&ops[0], ServerOp::Message { .. });
            assert_eq!(ServerOp::Ping, ops[1]);
        }
    }

    #[test]
    fn decodes_status_bearing_message() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG _INBOX.abc.1 1 16 16\r\nNATS/1.0 503\r\n\r\n\r\n",
        ));
        let Some(ServerOp::Message { message }) = decoder.decode().unwrap() else {
            panic!("expected HMSG");
        };
        assert_eq!(Some(StatusCode::NO_RESPONDERS), message.status_code);
        assert!(message.message.payload.is_empty());
    }

    #[test]
    fn status_message_header_lines_are_skipped() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG orders 1 33 37\r\nNATS/1.0 408\r\nNats-Pending: 1\r\n\r\ndata\r\n",
        ));
        let Some(ServerOp::Message { message }) = decoder.decode().unwrap() else {
            panic!("expected HMSG");
        };
        assert_eq!(Some(StatusCode::TIMEOUT), message.status_code);
        assert_eq!(Bytes::from_static(b"data"), message.message.payload);
    }

    #[test]
    fn rejects_unknown_operations() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"NONSENSE\r\n"));
        assert_err!(decoder.decode());
    }

    #[test]
    fn rejects_malformed_msg_args() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"MSG orders.created\r\n"));
        assert_err!(decoder.decode());
    }
}
