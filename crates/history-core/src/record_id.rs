//! RecordId: Unique identifier for a record in the history tree.
//!
//! Wraps a v4 UUID internally but displays as the canonical hyphenated
//! string. Ids are assigned once at record creation and survive sync,
//! so they are the only stable way to refer to a record across devices.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordIdError {
    #[error("Invalid record ID: {0}")]
    InvalidFormat(#[from] uuid::Error),
}

/// A unique identifier for a record in the history tree.
///
/// # Examples
/// ```
/// use history_core::RecordId;
///
/// let id = RecordId::generate();
/// let parsed: RecordId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a new random record ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The fixed sentinel id used for transient roster rows that do not
    /// correspond to a stored record yet (e.g. a just-accepted sharer).
    pub fn placeholder() -> Self {
        Self(Uuid::nil())
    }

    /// Check whether this is the placeholder sentinel.
    pub fn is_placeholder(&self) -> bool {
        self.0.is_nil()
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = RecordIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for RecordId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<RecordId> for Uuid {
    fn from(id: RecordId) -> Uuid {
        id.0
    }
}

// Serialize as the hyphenated string for consistency in logs, errors, JSON
impl serde::Serialize for RecordId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RecordId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
