use bytes::Bytes;

use crate::{StatusCode, Subject, SubscriptionId};

/// An application message
///
/// The payload is an opaque byte sequence; the library never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub payload: Bytes,
}

/// A message delivered by the server, routed by subscription id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Status attached by the server, e.g. `503` for no responders
    pub status_code: Option<StatusCode>,
    pub subscription_id: SubscriptionId,
    pub message: Message,
}
