use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A validated queue group name
///
/// Subscribers sharing a queue group receive each matching message on
/// exactly one member of the group.
///
/// A `QueueGroup` is guaranteed [^1] to be non-empty, at most 64 bytes
/// long [^2] and free of whitespace.
///
/// [^1]: [`QueueGroup::from_dangerous_value`] is safe to call, so unsafe
///       code must not rely on these invariants.
/// [^2]: Values received from the server may violate the length rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueGroup(ByteString);

const MAX_QUEUE_GROUP_LEN: usize = 64;

impl QueueGroup {
    /// Construct `QueueGroup` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` isn't a valid queue group.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid QueueGroup")
    }

    /// Construct a `QueueGroup` without validating it
    ///
    /// Skips the checks performed by [`QueueGroup::from_static`] and the
    /// `TryFrom` implementations. Sending an unvalidated queue group to
    /// the server can corrupt the protocol stream.
    #[expect(
        clippy::missing_panics_doc,
        reason = "validation only runs in debug builds"
    )]
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate(&value) {
                panic!("QueueGroup {value:?} isn't valid {err:?}");
            }
        }
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for QueueGroup {
    type Error = QueueGroupValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for QueueGroup {
    type Error = QueueGroupValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value.into()))
    }
}

impl TryFrom<&str> for QueueGroup {
    type Error = QueueGroupValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate(value)?;
        Ok(Self(ByteString::from(value)))
    }
}

impl From<QueueGroup> for ByteString {
    fn from(value: QueueGroup) -> Self {
        value.0
    }
}

impl AsRef<str> for QueueGroup {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for QueueGroup {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Serialize for QueueGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueueGroup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while validating [`QueueGroup`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum QueueGroupValidateError {
    /// The value is empty
    #[error("queue group is empty")]
    Empty,
    /// The value is longer than 64 bytes
    #[error("queue group is too long")]
    TooLong,
    /// The value contains a whitespace character
    #[error("queue group contains whitespace")]
    Whitespace,
}

fn validate(queue_group: &str) -> Result<(), QueueGroupValidateError> {
    if queue_group.is_empty() {
        return Err(QueueGroupValidateError::Empty);
    }
    if queue_group.len() > MAX_QUEUE_GROUP_LEN {
        return Err(QueueGroupValidateError::TooLong);
    }
    if queue_group.chars().any(char::is_whitespace) {
        return Err(QueueGroupValidateError::Whitespace);
    }

    Ok(())
}
