use std::{fmt, sync::Arc};

use rhubarb_net::error::ConnectError;
use rhubarb_proto::error::SubjectValidateError;

/// The category of an [`Error`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The peer violated the wire protocol
    Protocol,
    /// An I/O error on the underlying transport
    Io,
    /// A deadline elapsed before the operation completed
    Timeout,
    /// An argument was rejected, e.g. a zero flush timeout
    InvalidArg,
    /// A subject failed validation
    InvalidSubject,
    /// The subscription has been removed or closed
    InvalidSubscription,
    /// The connection is closed; the operation can never succeed
    ConnectionClosed,
    /// The server requires TLS but the client didn't enable it
    SecureConnectionRequired,
    /// No server in the pool could be connected to
    NoServers,
    /// The operation is not allowed in the current state,
    /// e.g. a second concurrent flush
    NotPermitted,
    /// The payload exceeds the server's `max_payload`
    MaxPayload,
    /// The subscription already delivered its auto-unsubscribe maximum
    MaxMessagesDelivered,
    /// Messages were dropped because the subscription's pending queue
    /// was full
    SlowConsumer,
    /// The server stopped answering heartbeats
    StaleConnection,
    /// The server rejected the client's credentials
    Auth,
    /// A request was published to a subject with no subscribers
    NoResponders,
    /// The reconnect pending buffer is full
    InsufficientBuffer,
    /// The operation doesn't apply to this kind of subscription
    IllegalState,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol error",
            Self::Io => "i/o error",
            Self::Timeout => "timeout",
            Self::InvalidArg => "invalid argument",
            Self::InvalidSubject => "invalid subject",
            Self::InvalidSubscription => "invalid subscription",
            Self::ConnectionClosed => "connection closed",
            Self::SecureConnectionRequired => "secure connection required",
            Self::NoServers => "no servers available for connection",
            Self::NotPermitted => "not permitted",
            Self::MaxPayload => "maximum payload exceeded",
            Self::MaxMessagesDelivered => "maximum messages delivered",
            Self::SlowConsumer => "slow consumer, messages dropped",
            Self::StaleConnection => "stale connection",
            Self::Auth => "authorization failed",
            Self::NoResponders => "no responders available for request",
            Self::InsufficientBuffer => "reconnect buffer full",
            Self::IllegalState => "illegal state",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error produced by the client
///
/// Errors carry an [`ErrorKind`] for programmatic matching plus a short
/// human readable description. The most recent error is also retained by
/// the client and readable through `Client::last_error`.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<Arc<str>>,
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub(crate) fn with_detail(kind: ErrorKind, detail: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    /// The category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("detail", &self.detail)
            .finish()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<SubjectValidateError> for Error {
    fn from(err: SubjectValidateError) -> Self {
        Self::with_detail(ErrorKind::InvalidSubject, err.to_string())
    }
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Io(err) => Self::with_detail(ErrorKind::Io, err.to_string()),
            ConnectError::InvalidDnsName(err) => {
                Self::with_detail(ErrorKind::InvalidArg, err.to_string())
            }
            ConnectError::Decoder(err) => Self::with_detail(ErrorKind::Protocol, err.to_string()),
            ConnectError::UnexpectedServerOp => {
                Self::with_detail(ErrorKind::Protocol, "unexpected operation during handshake")
            }
            ConnectError::SecureConnectionRequired => {
                Self::new(ErrorKind::SecureConnectionRequired)
            }
            ConnectError::Authentication(err) => Self::with_detail(ErrorKind::Auth, err.to_string()),
            ConnectError::ServerRejected(err) => {
                Self::with_detail(ErrorKind::Protocol, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn display_includes_detail() {
        let err = Error::new(ErrorKind::Timeout);
        assert_eq!("timeout", err.to_string());

        let err = Error::with_detail(ErrorKind::Io, "connection reset");
        assert_eq!("i/o error: connection reset", err.to_string());
    }

    #[test]
    fn kind_survives_clone() {
        let err = Error::with_detail(ErrorKind::SlowConsumer, "sub 3");
        assert_eq!(ErrorKind::SlowConsumer, err.clone().kind());
    }
}
