use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Byte width of every identifier the store accepts.
pub const UUID_BYTES: usize = 16;

/// Length of the canonical hyphenated textual form.
pub const UUID_TEXT_LEN: usize = 36;

/// Errors raised while parsing identifiers received from callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("{kind} is not a hyphenated 16-byte UUID: {value:?}")]
    Malformed { kind: &'static str, value: String },
}

fn parse_uuid(kind: &'static str, value: &str) -> Result<Uuid, IdParseError> {
    let malformed = || IdParseError::Malformed {
        kind,
        value: value.to_string(),
    };
    if value.len() != UUID_TEXT_LEN {
        return Err(malformed());
    }
    Uuid::parse_str(value).map_err(|_| malformed())
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Parse the canonical hyphenated form.
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                parse_uuid($kind, value).map(Self)
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8; UUID_BYTES] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id!(
    /// Store-assigned identifier of a quarantined object, stable for its lifetime.
    ObjectId,
    "object id"
);

uuid_id!(
    /// Identifier of a threat. Several objects may share one.
    ThreatId,
    "threat id"
);

uuid_id!(
    /// Links a quarantined object back to the detection report that caused it.
    CorrelationId,
    "correlation id"
);

impl ObjectId {
    /// Allocate a fresh identifier for a newly stored object.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}
