//! Stream names identify append-only sequences of events.
//!
//! A stream name is any non-empty string. Two conventions are layered on top:
//! names starting with `$` denote internal streams, which wildcard selectors
//! skip, and names of the form `<category>-<rest>` place a stream in a
//! category that category selectors can address as a group.
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// A validated, non-empty name of an event stream.
///
/// # Examples
///
/// ```
/// use chronicle::StreamName;
///
/// let name = StreamName::new("user-123").unwrap();
/// assert!(name.in_category("user"));
/// assert!(!name.is_internal());
/// ```
#[derive(Debug, Hash, PartialEq, Eq, Clone, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StreamName(String);

/// Error returned when a stream name fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid stream name: {0:?}")]
pub struct StreamNameError(String);

impl StreamName {
    /// Creates a new stream name from a string.
    ///
    /// # Errors
    ///
    /// Returns a `StreamNameError` if the string is empty or whitespace only.
    pub fn new(name: impl Into<String>) -> Result<Self, StreamNameError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StreamNameError(name));
        }
        Ok(Self(name))
    }

    /// Whether this is an internal stream, i.e. its name starts with `$`.
    ///
    /// Internal streams are excluded from `from_all` and category selectors.
    pub fn is_internal(&self) -> bool {
        self.0.starts_with('$')
    }

    /// The category prefix of the name: the text before the first `-`.
    pub fn category(&self) -> Option<&str> {
        self.0
            .split_once('-')
            .map(|(prefix, _)| prefix)
            .filter(|prefix| !prefix.is_empty())
    }

    /// Whether the name starts with `"<category>-"`.
    pub fn in_category(&self, category: &str) -> bool {
        !category.is_empty()
            && self
                .0
                .strip_prefix(category)
                .is_some_and(|rest| rest.starts_with('-'))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the name, returning the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for StreamName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for StreamName {
    type Error = StreamNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for StreamName {
    type Error = StreamNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
