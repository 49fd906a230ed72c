//! Identifiers for reconciled objects and reconciler workers.
//!
//! - [`ObjectId`] is assigned by the canonical store. It is opaque to keel:
//!   stores that use numeric keys and stores that use string keys both map
//!   onto it, and it serializes back in the shape it arrived in. A JSON
//!   string stays a string even when it looks like a number, so `"007"`
//!   and `7` are different objects.
//! - [`WorkerId`] is generated locally and identifies the process that owns
//!   a lock entry. ULIDs sort by creation time, which makes stale holders
//!   easy to spot when listing a lock bucket.
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::{ObjectId, WorkerId};
//!
//! let numeric = ObjectId::from(42_u64);
//! let opaque: ObjectId = "gw-7f3a".parse().unwrap();
//! assert_eq!(numeric.to_string(), "42");
//! assert_ne!(numeric, opaque);
//!
//! let worker = WorkerId::generate();
//! assert!(!worker.to_string().is_empty());
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Stable identifier of a domain object in the canonical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Repr);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Repr {
    Numeric(u64),
    Opaque(String),
}

impl ObjectId {
    /// Returns the numeric form of the ID, if the store assigned one.
    #[must_use]
    pub const fn as_u64(&self) -> Option<u64> {
        match &self.0 {
            Repr::Numeric(n) => Some(*n),
            Repr::Opaque(_) => None,
        }
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        Self(Repr::Numeric(value))
    }
}

impl ObjectId {
    /// Creates a string ID, kept verbatim even if it looks numeric.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if `value` is empty or contains `.`.
    pub fn opaque(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::InvalidId {
                message: "object ID must not be empty".into(),
            });
        }
        if value.contains('.') {
            // '.' separates reconciler name and object ID in lock keys.
            return Err(Error::InvalidId {
                message: format!("object ID '{value}' must not contain '.'"),
            });
        }
        Ok(Self(Repr::Opaque(value)))
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    /// Parses canonical decimal text as a numeric ID and anything else,
    /// including `"007"` and `"+5"`, as an opaque one.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.parse::<u64>() {
            Ok(n) if n.to_string() == trimmed => Ok(Self::from(n)),
            _ => Self::opaque(trimmed),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Numeric(n) => write!(f, "{n}"),
            Repr::Opaque(s) => f.write_str(s),
        }
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.0 {
            Repr::Numeric(n) => serializer.serialize_u64(*n),
            Repr::Opaque(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Numeric(u64),
            Opaque(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Numeric(n) => Ok(Self::from(n)),
            Wire::Opaque(s) => Self::opaque(s).map_err(serde::de::Error::custom),
        }
    }
}

/// Identity of a reconciler worker process, recorded as the lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Ulid);

impl WorkerId {
    /// Generates a new unique worker ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid worker ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_parse_to_numeric_ids() {
        let parsed: ObjectId = "42".parse().unwrap();
        assert_eq!(parsed, ObjectId::from(42));
        assert_eq!(parsed.as_u64(), Some(42));
    }

    #[test]
    fn opaque_ids_survive_display() {
        let id: ObjectId = "secret-a1b2".parse().unwrap();
        assert_eq!(id.to_string(), "secret-a1b2");
        assert_eq!(id.as_u64(), None);
    }

    #[test]
    fn rejects_empty_and_dotted_ids() {
        assert!("".parse::<ObjectId>().is_err());
        assert!("   ".parse::<ObjectId>().is_err());
        assert!("a.b".parse::<ObjectId>().is_err());
    }

    #[test]
    fn deserializes_numbers_and_strings() {
        let numeric: ObjectId = serde_json::from_str("7").unwrap();
        let opaque: ObjectId = serde_json::from_str("\"gw-1\"").unwrap();
        assert_eq!(numeric, ObjectId::from(7));
        assert_eq!(opaque.to_string(), "gw-1");

        assert_eq!(serde_json::to_string(&numeric).unwrap(), "7");
        assert_eq!(serde_json::to_string(&opaque).unwrap(), "\"gw-1\"");
    }

    #[test]
    fn numeric_looking_strings_keep_their_shape() {
        for raw in ["\"007\"", "\"+5\"", "\"42\""] {
            let id: ObjectId = serde_json::from_str(raw).unwrap();
            assert_eq!(id.as_u64(), None, "{raw}");
            assert_eq!(serde_json::to_string(&id).unwrap(), raw);
        }
        let padded: ObjectId = serde_json::from_str("\"007\"").unwrap();
        assert_eq!(padded.to_string(), "007");
        assert_ne!(padded, ObjectId::from(7));
    }

    #[test]
    fn only_canonical_decimal_text_parses_as_numeric() {
        let padded: ObjectId = "007".parse().unwrap();
        let signed: ObjectId = "+5".parse().unwrap();
        assert_eq!(padded.to_string(), "007");
        assert_eq!(padded.as_u64(), None);
        assert_eq!(signed.to_string(), "+5");
        assert_eq!(signed.as_u64(), None);

        let id = ObjectId::from(7);
        assert_eq!(id.to_string().parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn opaque_rejects_dotted_and_blank_strings() {
        assert!(ObjectId::opaque("a.b").is_err());
        assert!(ObjectId::opaque(" ").is_err());
        assert!(serde_json::from_str::<ObjectId>("\"a.b\"").is_err());
    }

    #[test]
    fn worker_id_roundtrips_through_display() {
        let worker = WorkerId::generate();
        let parsed: WorkerId = worker.to_string().parse().unwrap();
        assert_eq!(worker, parsed);
    }
}
