use safestore_types::{ObjectId, ObjectStatus, ObjectType, ThreatId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

/// Fields persisted for each stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub status: ObjectStatus,
    /// Final path component, kept byte for byte.
    #[serde(with = "raw_os")]
    pub name: OsString,
    #[serde(with = "raw_os")]
    pub location: PathBuf,
    pub threat_id: ThreatId,
    pub threat_name: String,
    /// Plaintext length in bytes.
    pub size: u64,
    /// Hex SHA-256 of the plaintext, checked on every restore.
    pub digest: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Seconds since UNIX_EPOCH.
    pub stored_at: u64,
}

/// Criteria for [`crate::ObjectStore::find`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub object_type: Option<ObjectType>,
    pub status: Option<ObjectStatus>,
    pub threat_id: Option<ThreatId>,
    pub name: Option<OsString>,
    pub location: Option<PathBuf>,
}

impl SearchFilter {
    /// Every object of type FILE.
    pub fn files() -> Self {
        Self {
            object_type: Some(ObjectType::File),
            ..Self::default()
        }
    }

    pub fn with_threat_id(mut self, threat_id: ThreatId) -> Self {
        self.threat_id = Some(threat_id);
        self
    }

    pub fn with_status(mut self, status: ObjectStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<OsString>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn matches(&self, record: &ObjectRecord) -> bool {
        self.object_type.map_or(true, |t| t == record.object_type)
            && self.status.map_or(true, |s| s == record.status)
            && self.threat_id.map_or(true, |id| id == record.threat_id)
            && self.name.as_ref().map_or(true, |n| *n == record.name)
            && self
                .location
                .as_ref()
                .map_or(true, |l| *l == record.location)
    }
}

/// Names and directories are not necessarily UTF-8, so they are persisted as
/// their raw bytes.
mod raw_os {
    use super::*;

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<OsStr>,
    {
        serializer.serialize_bytes(value.as_ref().as_bytes())
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: From<OsString>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(T::from(OsString::from_vec(bytes)))
    }
}
