use bytestring::ByteString;

/// An error reported by the server through an `-ERR` frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("authorization violation")]
    AuthorizationViolation,
    #[error("authorization timeout")]
    AuthorizationTimeout,
    #[error("secure connection, tls required")]
    TlsRequired,
    #[error("stale connection")]
    StaleConnection,
    #[error("maximum connections exceeded")]
    MaximumConnectionsExceeded,
    #[error("maximum payload violation")]
    MaximumPayloadViolation,
    #[error("invalid subject")]
    InvalidSubject,
    #[error("permissions violation")]
    PermissionsViolation,
    #[error("unknown protocol operation")]
    UnknownProtocolOperation,
    #[error("parser error")]
    ParseError,

    #[error("unknown error: {raw_message}")]
    Other { raw_message: ByteString },
}

impl ServerError {
    /// Whether this error means the server considers the connection dead
    /// but a reconnect is worth attempting
    #[must_use]
    pub fn is_stale_connection(&self) -> bool {
        matches!(self, Self::StaleConnection)
    }

    /// Whether this error was produced by authentication
    #[must_use]
    pub fn is_auth_violation(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationViolation | Self::AuthorizationTimeout
        )
    }

    pub(crate) fn parse(raw_message: ByteString) -> Self {
        const PERMISSIONS: &str = "Permissions Violation";

        let m = raw_message.trim();
        if m.eq_ignore_ascii_case("Authorization Violation") {
            Self::AuthorizationViolation
        } else if m.eq_ignore_ascii_case("Authorization Timeout") {
            Self::AuthorizationTimeout
        } else if m.eq_ignore_ascii_case("Secure Connection - TLS Required") {
            Self::TlsRequired
        } else if m.eq_ignore_ascii_case("Stale Connection") {
            Self::StaleConnection
        } else if m.eq_ignore_ascii_case("Maximum Connections Exceeded") {
            Self::MaximumConnectionsExceeded
        } else if m.eq_ignore_ascii_case("Maximum Payload Violation") {
            Self::MaximumPayloadViolation
        } else if m.eq_ignore_ascii_case("Invalid Subject") {
            Self::InvalidSubject
        } else if m.len() >= PERMISSIONS.len()
            && m[..PERMISSIONS.len()].eq_ignore_ascii_case(PERMISSIONS)
        {
            Self::PermissionsViolation
        } else if m.eq_ignore_ascii_case("Unknown Protocol Operation") {
            Self::UnknownProtocolOperation
        } else if m.eq_ignore_ascii_case("Parser Error") {
            Self::ParseError
        } else {
            Self::Other { raw_message }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::ServerError;

    #[test]
    fn parses_known_messages_case_insensitively() {
        let cases = [
            ("Stale Connection", ServerError::StaleConnection),
            ("stale connection", ServerError::StaleConnection),
            (
                "Authorization Violation",
                ServerError::AuthorizationViolation,
            ),
            (
                "Secure Connection - TLS Required",
                ServerError::TlsRequired,
            ),
            (
                "Permissions Violation for Publish to \"foo\"",
                ServerError::PermissionsViolation,
            ),
        ];
        for (raw, expected) in cases {
            assert_eq!(expected, ServerError::parse(ByteString::from_static(raw)));
        }
    }

    #[test]
    fn unknown_messages_are_preserved() {
        let err = ServerError::parse(ByteString::from_static("Something Novel"));
        assert_eq!(
            ServerError::Other {
                raw_message: "Something Novel".into()
            },
            err
        );
        assert!(!err.is_stale_connection());
        assert!(!err.is_auth_violation());
    }
}
