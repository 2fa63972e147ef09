//! Session identifiers.
//!
//! Format: `ses_{ulid}`. ULIDs sort by creation time, so a store that keeps
//! insertion order and a listing sorted by ID agree for a single process.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::EventError;

/// Identifies the proxy session an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Ulid);

impl SessionId {
    /// The prefix for session IDs.
    pub const PREFIX: &'static str = "ses";

    /// Creates a new ID with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Creates an ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Parses an ID in the format `ses_{ulid}`.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        if s.is_empty() {
            return Err(EventError::EmptyId);
        }

        let (prefix, ulid_str) = s.split_once('_').unwrap_or((s, ""));
        if prefix != Self::PREFIX {
            return Err(EventError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }

        let ulid = ulid_str
            .parse::<Ulid>()
            .map_err(|e| EventError::InvalidUlid(e.to_string()))?;

        Ok(Self(ulid))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for SessionId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        let id = SessionId::new();
        let s = id.to_string();
        assert!(s.starts_with("ses_"));
        assert_eq!(s.parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(SessionId::parse(""), Err(EventError::EmptyId));
        assert!(matches!(
            SessionId::parse("app_01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(EventError::InvalidPrefix { .. })
        ));
        assert!(matches!(
            SessionId::parse("01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(EventError::InvalidPrefix { .. })
        ));
        assert!(matches!(
            SessionId::parse("ses_not-a-ulid"),
            Err(EventError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
