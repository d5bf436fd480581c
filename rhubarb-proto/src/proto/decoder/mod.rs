use core::{mem, ops::Deref};

use bytes::{Buf, Bytes, BytesMut};
use bytestring::ByteString;

use crate::{
    error::ServerError,
    status_code::StatusCodeError,
    util::{self, ParseUintError},
    Message, ServerMessage, StatusCode, Subject, SubscriptionId,
};

pub use self::stream::StreamDecoder;

use super::ServerOp;

mod stream;

const MAX_CONTROL_LINE_LEN: usize = 16 * 1024;

/// The decoding state machine
///
/// `ControlLine` consumes bytes until a complete `\r\n` terminated line
/// is available, dispatches on the operation name, and for `MSG`/`HMSG`
/// hands over to the length-driven `Headers`/`Payload` states which read
/// exactly the advertised number of bytes regardless of how the stream
/// was chunked by the transport.
#[derive(Debug)]
pub(super) enum DecodeState {
    ControlLine {
        // Bytes already scanned for `\r\n` without finding one,
        // so the next scan can skip them
        scanned: usize,
    },
    Headers {
        subscription_id: SubscriptionId,
        subject: Subject,
        reply_subject: Option<Subject>,
        header_len: usize,
        payload_len: usize,
    },
    Payload {
        subscription_id: SubscriptionId,
        subject: Subject,
        reply_subject: Option<Subject>,
        status_code: Option<StatusCode>,
        payload_len: usize,
    },
    Poisoned,
}

impl DecodeState {
    pub(super) const fn initial() -> Self {
        Self::ControlLine { scanned: 0 }
    }
}

pub(super) trait BytesLike: Buf + Deref<Target = [u8]> {
    fn len(&self) -> usize {
        Buf::remaining(self)
    }

    fn split_to(&mut self, at: usize) -> Bytes {
        self.copy_to_bytes(at)
    }
}

impl BytesLike for Bytes {}
impl BytesLike for BytesMut {}

pub(super) fn decode(
    state: &mut DecodeState,
    read_buf: &mut impl BytesLike,
) -> Result<Option<ServerOp>, DecoderError> {
    loop {
        match state {
            DecodeState::ControlLine { scanned } => {
                if *scanned == read_buf.len() {
                    // No new bytes since the last scan
                    return Ok(None);
                }

                let Some(line_len) = memchr::memmem::find(read_buf, b"\r\n") else {
                    if read_buf.len() > MAX_CONTROL_LINE_LEN {
                        return Err(DecoderError::ControlLineTooLong {
                            len: read_buf.len(),
                        });
                    }
                    *scanned = read_buf.len();
                    return Ok(None);
                };

                let mut line = read_buf.split_to(line_len + "\r\n".len());
                line.truncate(line.len() - "\r\n".len());
                *scanned = 0;

                match dispatch_control_line(line)? {
                    Dispatched::Op(op) => return Ok(Some(op)),
                    Dispatched::NeedMore(next) => *state = next,
                }
            }
            DecodeState::Headers { header_len, .. } => {
                if read_buf.len() < *header_len {
                    return Ok(None);
                }

                decode_status_head(read_buf, state)?;
            }
            DecodeState::Payload { payload_len, .. } => {
                if read_buf.len() < *payload_len + "\r\n".len() {
                    return Ok(None);
                }

                let DecodeState::Payload {
                    subscription_id,
                    subject,
                    reply_subject,
                    status_code,
                    payload_len,
                } = mem::replace(state, DecodeState::initial())
                else {
                    unreachable!()
                };

                let payload = read_buf.split_to(payload_len);
                read_buf.advance("\r\n".len());
                let message = ServerMessage {
                    status_code,
                    subscription_id,
                    message: Message {
                        subject,
                        reply_subject,
                        payload,
                    },
                };
                return Ok(Some(ServerOp::Message { message }));
            }
            DecodeState::Poisoned => return Err(DecoderError::Poisoned),
        }
    }
}

enum Dispatched {
    Op(ServerOp),
    NeedMore(DecodeState),
}

fn op_name_matches(line: &[u8], name: &[u8]) -> bool {
    line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name)
}

// Operation names are matched case-insensitively, as the protocol allows.
fn dispatch_control_line(mut line: Bytes) -> Result<Dispatched, DecoderError> {
    if op_name_matches(&line, b"MSG ") {
        line.advance("MSG ".len());
        return decode_msg_args(line, false).map(Dispatched::NeedMore);
    }
    if op_name_matches(&line, b"HMSG ") {
        line.advance("HMSG ".len());
        return decode_msg_args(line, true).map(Dispatched::NeedMore);
    }
    if op_name_matches(&line, b"PING") {
        return Ok(Dispatched::Op(ServerOp::Ping));
    }
    if op_name_matches(&line, b"PONG") {
        return Ok(Dispatched::Op(ServerOp::Pong));
    }
    if line.starts_with(b"+") && op_name_matches(&line[1..], b"OK") {
        return Ok(Dispatched::Op(ServerOp::Success));
    }
    if line.starts_with(b"-") && op_name_matches(&line[1..], b"ERR ") {
        line.advance("-ERR ".len());
        if line.len() < "''".len() || !line.starts_with(b"'") || !line.ends_with(b"'") {
            return Err(DecoderError::InvalidErrorMessage);
        }

        line.advance(1);
        line.truncate(line.len() - 1);
        let raw_message =
            ByteString::try_from(line).map_err(|_| DecoderError::InvalidErrorMessage)?;
        let error = ServerError::parse(raw_message);
        return Ok(Dispatched::Op(ServerOp::Error { error }));
    }
    if op_name_matches(&line, b"INFO ") {
        let info =
            serde_json::from_slice(&line["INFO ".len()..]).map_err(DecoderError::InvalidInfo)?;
        return Ok(Dispatched::Op(ServerOp::Info { info }));
    }

    Err(DecoderError::UnknownOperation)
}

/// Parse the arguments of `MSG` / `HMSG`:
///
/// ```text
/// MSG  <subject> <sid> [reply] <payload-len>
/// HMSG <subject> <sid> [reply] <header-len> <total-len>
/// ```
fn decode_msg_args(args: Bytes, with_headers: bool) -> Result<DecodeState, DecoderError> {
    let mut chunks = util::split_spaces(args);
    let (subject, subscription_id, reply_subject, first_len, second_len) = match (
        chunks.next(),
        chunks.next(),
        chunks.next(),
        chunks.next(),
        chunks.next(),
        chunks.next(),
    ) {
        (Some(subject), Some(sid), Some(reply), Some(a), Some(b), None) if with_headers => {
            (subject, sid, Some(reply), a, Some(b))
        }
        (Some(subject), Some(sid), Some(a), Some(b), None, None) if with_headers => {
            (subject, sid, None, a, Some(b))
        }
        (Some(subject), Some(sid), Some(reply), Some(a), None, None) if !with_headers => {
            (subject, sid, Some(reply), a, None)
        }
        (Some(subject), Some(sid), Some(a), None, None, None) if !with_headers => {
            (subject, sid, None, a, None)
        }
        _ => return Err(DecoderError::InvalidArgumentCount),
    };

    let subject = Subject::from_dangerous_value(
        subject
            .try_into()
            .map_err(|_| DecoderError::SubjectInvalidUtf8)?,
    );
    let subscription_id =
        SubscriptionId::from_ascii_bytes(&subscription_id).map_err(DecoderError::SubscriptionId)?;
    let reply_subject = reply_subject
        .map(|reply_subject| {
            ByteString::try_from(reply_subject).map_err(|_| DecoderError::ReplySubjectInvalidUtf8)
        })
        .transpose()?
        .map(Subject::from_dangerous_value);

    if let Some(total_len) = second_len {
        let header_len =
            util::parse_usize(&first_len).map_err(DecoderError::InvalidHeaderLength)?;
        let total_len =
            util::parse_usize(&total_len).map_err(DecoderError::InvalidPayloadLength)?;
        let payload_len = total_len
            .checked_sub(header_len)
            .ok_or(DecoderError::InvalidTotalLength)?;

        Ok(DecodeState::Headers {
            subscription_id,
            subject,
            reply_subject,
            header_len,
            payload_len,
        })
    } else {
        let payload_len =
            util::parse_usize(&first_len).map_err(DecoderError::InvalidPayloadLength)?;

        Ok(DecodeState::Payload {
            subscription_id,
            subject,
            reply_subject,
            status_code: None,
            payload_len,
        })
    }
}

/// Consume the header block of an `HMSG`
///
/// Only the status code on the `NATS/1.0` head line is extracted;
/// individual header lines are skipped.
fn decode_status_head(
    read_buf: &mut impl BytesLike,
    state: &mut DecodeState,
) -> Result<(), DecoderError> {
    let DecodeState::Headers {
        subscription_id,
        subject,
        reply_subject,
        header_len,
        payload_len,
    } = mem::replace(state, DecodeState::Poisoned)
    else {
        unreachable!()
    };

    let header = read_buf.split_to(header_len);
    let mut lines = util::lines_iter(header);
    let head = lines.next().ok_or(DecoderError::MissingStatusHead)?;
    let head = head
        .strip_prefix(b"NATS/1.0")
        .ok_or(DecoderError::InvalidStatusHead)?;
    let status_code = if head.len() >= 4 {
        Some(StatusCode::from_ascii_bytes(&head[1..4]).map_err(DecoderError::StatusCode)?)
    } else {
        None
    };

    *state = DecodeState::Payload {
        subscription_id,
        subject,
        reply_subject,
        status_code,
        payload_len,
    };
    Ok(())
}

/// An error encountered while decoding the incoming byte stream
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("control line exceeded the maximum length (len {len} maximum {MAX_CONTROL_LINE_LEN})")]
    ControlLineTooLong { len: usize },
    #[error("unknown protocol operation")]
    UnknownOperation,
    #[error("message command has an unexpected number of arguments")]
    InvalidArgumentCount,
    #[error("the subject isn't valid utf-8")]
    SubjectInvalidUtf8,
    #[error("the reply subject isn't valid utf-8")]
    ReplySubjectInvalidUtf8,
    #[error("couldn't parse the subscription id")]
    SubscriptionId(#[source] ParseUintError),
    #[error("couldn't parse the header length")]
    InvalidHeaderLength(#[source] ParseUintError),
    #[error("couldn't parse the payload length")]
    InvalidPayloadLength(#[source] ParseUintError),
    #[error("the header length is greater than the total length")]
    InvalidTotalLength,
    #[error("status-bearing message is missing its head line")]
    MissingStatusHead,
    #[error("status-bearing message has an invalid head line")]
    InvalidStatusHead,
    #[error("couldn't parse the status code")]
    StatusCode(#[source] StatusCodeError),
    #[error("INFO JSON document couldn't be deserialized")]
    InvalidInfo(#[source] serde_json::Error),
    #[error("-ERR message couldn't be deserialized")]
    InvalidErrorMessage,
    #[error("the decoder was poisoned")]
    Poisoned,
}
