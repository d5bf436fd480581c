use core::fmt::{self, Display};

use crate::util::{self, ParseUintError};

/// A client assigned subscription identifier
///
/// The client picks a fresh id for every `SUB` it sends; the server
/// echoes it back on each `MSG` so the message can be routed to the
/// right subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const MIN: Self = SubscriptionId(1);
    pub const MAX: Self = SubscriptionId(u64::MAX);

    /// Parse a `SubscriptionId` from its ASCII decimal representation.
    ///
    /// # Errors
    ///
    /// It returns an error if the bytes are not a decimal number.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, ParseUintError> {
        util::parse_u64(buf).map(Self)
    }
}

impl From<u64> for SubscriptionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SubscriptionId> for u64 {
    fn from(value: SubscriptionId) -> Self {
        value.0
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
