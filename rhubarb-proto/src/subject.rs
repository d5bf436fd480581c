use alloc::string::String;
use core::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A validated subject name
///
/// Subjects are dot delimited hierarchies like `orders.eu.created`.
/// A token may be the single-token wildcard `*`, and the last token
/// may be the tail wildcard `>`.
///
/// A `Subject` is guaranteed [^1] to:
///
/// * be non-empty and at most 256 bytes long [^2]
/// * contain no whitespace
/// * contain no empty tokens
/// * place `*` and `>` only as whole tokens, with `>` only at the end
///
/// Construct one via [`Subject::from_static`] or the `TryFrom`
/// implementations.
///
/// [^1]: [`Subject::from_dangerous_value`] is safe to call, so unsafe
///       code must not rely on these invariants.
/// [^2]: Subjects received from the server may violate the length rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subject(ByteString);

const MAX_SUBJECT_LEN: usize = 256;

impl Subject {
    /// Construct `Subject` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` isn't a valid subject.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid Subject")
    }

    /// Construct a `Subject` without validating it
    ///
    /// Skips the checks performed by [`Subject::from_static`] and the
    /// `TryFrom` implementations. Sending an unvalidated subject to the
    /// server can corrupt the protocol stream, so callers must be certain
    /// the value is well formed.
    #[expect(
        clippy::missing_panics_doc,
        reason = "validation only runs in debug builds"
    )]
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate(&value) {
                panic!("Subject {value:?} isn't valid {err:?}");
            }
        }
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value.into()))
    }
}

impl TryFrom<&str> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate(value)?;
        Ok(Self(ByteString::from(value)))
    }
}

impl From<Subject> for ByteString {
    fn from(value: Subject) -> Self {
        value.0
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<[u8]> for Subject {
    fn as_ref(&self) -> &[u8] {
        self.as_str().as_bytes()
    }
}

impl Deref for Subject {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while validating [`Subject`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum SubjectValidateError {
    /// The value is empty
    #[error("subject is empty")]
    Empty,
    /// The value is longer than 256 bytes
    #[error("subject is too long")]
    TooLong,
    /// The value contains a whitespace character
    #[error("subject contains whitespace")]
    Whitespace,
    /// The value contains an empty token
    #[error("subject contains an empty token")]
    EmptyToken,
    /// A `*` or `>` appears inside a longer token, or `>` is not last
    #[error("subject contains a misplaced wildcard")]
    MisplacedWildcard,
}

fn validate(subject: &str) -> Result<(), SubjectValidateError> {
    if subject.is_empty() {
        return Err(SubjectValidateError::Empty);
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(SubjectValidateError::TooLong);
    }

    // ` `, `\t`, `\r` and `\n` are the dangerous ones, but any whitespace
    // in a subject is a caller bug.
    if subject.chars().any(char::is_whitespace) {
        return Err(SubjectValidateError::Whitespace);
    }

    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        match token {
            "" => return Err(SubjectValidateError::EmptyToken),
            ">" if tokens.peek().is_some() => {
                return Err(SubjectValidateError::MisplacedWildcard)
            }
            "*" | ">" => {}
            _ if token.contains(['*', '>']) => {
                return Err(SubjectValidateError::MisplacedWildcard)
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::{Subject, SubjectValidateError};

    #[test]
    fn accepts_plain_and_wildcard_subjects() {
        let subjects = [
            "orders",
            "orders.created",
            "orders.eu.created",
            "orders.*.created",
            "orders.*.*",
            "orders.eu.>",
            ">",
            "*",
        ];
        for subject in subjects {
            let s = Subject::try_from(ByteString::from_static(subject)).unwrap();
            assert_eq!(subject, s.as_str());
        }
    }

    #[test]
    fn rejects_malformed_subjects() {
        let mut too_long = alloc::string::String::new();
        for _ in 0..260 {
            too_long.push('a');
        }

        let subjects = [
            ("", SubjectValidateError::Empty),
            (too_long.as_str(), SubjectValidateError::TooLong),
            ("orders ", SubjectValidateError::Whitespace),
            (" orders", SubjectValidateError::Whitespace),
            ("ord ers.created", SubjectValidateError::Whitespace),
            ("orders\r.created", SubjectValidateError::Whitespace),
            ("orders\n", SubjectValidateError::Whitespace),
            ("orders\t.created", SubjectValidateError::Whitespace),
            ("orders..created", SubjectValidateError::EmptyToken),
            (".orders", SubjectValidateError::EmptyToken),
            ("orders.", SubjectValidateError::EmptyToken),
            ("orders.**", SubjectValidateError::MisplacedWildcard),
            ("orders.a*", SubjectValidateError::MisplacedWildcard),
            ("orders.*a.created", SubjectValidateError::MisplacedWildcard),
            ("orders.>.created", SubjectValidateError::MisplacedWildcard),
            ("orders.a>", SubjectValidateError::MisplacedWildcard),
            ("orders.>a", SubjectValidateError::MisplacedWildcard),
        ];
        for (subject, expected) in subjects {
            let err = Subject::try_from(ByteString::from(subject)).unwrap_err();
            assert_eq!(expected, err, "subject {subject:?}");
        }
    }
}
