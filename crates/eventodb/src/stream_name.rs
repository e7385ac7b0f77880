//! Messages are written to and read from streams, identified by name.
//!
//! A stream name optionally includes an ID prefixed by a dash (`-`)
//! character. The part of the name preceding the first dash is the
//! *category*, and the part following it is the *cardinal ID*.
//!
//! # Examples
//!
//! `account`
//!
//! A stream with no cardinal ID. Its category is the whole name.
//!
//! `account-123`
//!
//! A stream for the account with ID `123`. Its category is `account`, and a
//! category read of `account` returns messages from every `account-…`
//! stream.
//!
//! Only the first `-` separates the category; all further dashes belong to
//! the cardinal ID, so `account-1-2` has the cardinal ID `1-2`.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ID separator between the category and the cardinal ID.
pub const ID_SEPARATOR: char = '-';

/// Returns the category part of a stream name: everything before the first
/// `-`, or the whole name when no `-` is present.
pub fn category(stream_name: &str) -> &str {
    stream_name
        .split_once(ID_SEPARATOR)
        .map(|(category, _)| category)
        .unwrap_or(stream_name)
}

/// Returns the cardinal ID part of a stream name: everything after the first
/// `-`, or the empty string when no `-` is present.
pub fn cardinal_id(stream_name: &str) -> &str {
    stream_name
        .split_once(ID_SEPARATOR)
        .map(|(_, id)| id)
        .unwrap_or("")
}

/// A validated stream name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    pub fn new(stream_name: impl Into<String>) -> Result<Self, InvalidStreamName> {
        let stream_name = stream_name.into();
        if stream_name.is_empty() {
            return Err(InvalidStreamName);
        }

        Ok(StreamName(stream_name))
    }

    pub fn category(&self) -> &str {
        category(&self.0)
    }

    pub fn cardinal_id(&self) -> &str {
        cardinal_id(&self.0)
    }

    /// Returns whether the name has no cardinal ID.
    pub fn is_category(&self) -> bool {
        !self.0.contains(ID_SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for StreamName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StreamName {
    type Error = InvalidStreamName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        StreamName::new(s)
    }
}

impl From<StreamName> for String {
    fn from(stream_name: StreamName) -> Self {
        stream_name.0
    }
}

#[derive(Clone, Copy, Debug, Error)]
#[error("empty stream name")]
pub struct InvalidStreamName;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_dash_only() {
        assert_eq!(category("account-123"), "account");
        assert_eq!(cardinal_id("account-123"), "123");
        assert_eq!(category("account-1-2"), "account");
        assert_eq!(cardinal_id("account-1-2"), "1-2");
    }

    #[test]
    fn name_without_dash_is_its_own_category() {
        assert_eq!(category("account"), "account");
        assert_eq!(cardinal_id("account"), "");

        let name = StreamName::new("account").unwrap();
        assert!(name.is_category());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(StreamName::new("").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let name = StreamName::new("workflow-7f3a").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"workflow-7f3a\"");
        let back: StreamName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);

        assert!(serde_json::from_str::<StreamName>("\"\"").is_err());
    }
}
