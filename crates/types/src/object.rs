use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of content held by a store object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    File,
    Unknown,
}

/// Lifecycle of a stored object.
///
/// `Stored` is the transient state between saving the bytes and finalising;
/// `Quarantined` is durable until the object is restored or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectStatus {
    Stored,
    Quarantined,
    Restored,
    RestoreFailed,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Stored => "STORED",
            ObjectStatus::Quarantined => "QUARANTINED",
            ObjectStatus::Restored => "RESTORED",
            ObjectStatus::RestoreFailed => "RESTORE_FAILED",
        }
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
