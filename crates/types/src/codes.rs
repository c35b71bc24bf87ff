use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of opening the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitReturnCode {
    Ok,
    DbError,
    DbOpenFailed,
    Failed,
    InvalidArg,
    UnsupportedOs,
    UnsupportedVersion,
    OutOfMemory,
}

impl InitReturnCode {
    /// Transient codes are retried without counting toward corruption.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InitReturnCode::InvalidArg
                | InitReturnCode::UnsupportedOs
                | InitReturnCode::UnsupportedVersion
                | InitReturnCode::OutOfMemory
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InitReturnCode::Ok => "OK",
            InitReturnCode::DbError => "DB_ERROR",
            InitReturnCode::DbOpenFailed => "DB_OPEN_FAILED",
            InitReturnCode::Failed => "FAILED",
            InitReturnCode::InvalidArg => "INVALID_ARG",
            InitReturnCode::UnsupportedOs => "UNSUPPORTED_OS",
            InitReturnCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            InitReturnCode::OutOfMemory => "OUT_OF_MEMORY",
        }
    }
}

impl fmt::Display for InitReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of saving a file into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveFileReturnCode {
    Ok,
    InvalidArg,
    DbError,
    MaxObjectSizeExceeded,
    MaxStoreSizeExceeded,
    FileReadFailed,
    Failed,
}

impl SaveFileReturnCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveFileReturnCode::Ok => "OK",
            SaveFileReturnCode::InvalidArg => "INVALID_ARG",
            SaveFileReturnCode::DbError => "DB_ERROR",
            SaveFileReturnCode::MaxObjectSizeExceeded => "MAX_OBJECT_SIZE_EXCEEDED",
            SaveFileReturnCode::MaxStoreSizeExceeded => "MAX_STORE_SIZE_EXCEEDED",
            SaveFileReturnCode::FileReadFailed => "FILE_READ_FAILED",
            SaveFileReturnCode::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SaveFileReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code handed back to quarantine callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuarantineResult {
    Success,
    NotFound,
    FailedToDeleteFile,
}

impl QuarantineResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineResult::Success => "SUCCESS",
            QuarantineResult::NotFound => "NOT_FOUND",
            QuarantineResult::FailedToDeleteFile => "FAILED_TO_DELETE_FILE",
        }
    }
}

impl fmt::Display for QuarantineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer options persisted inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreConfigOption {
    MaxSafestoreSize,
    MaxObjectSize,
    MaxStoredObjectCount,
}

impl StoreConfigOption {
    pub const ALL: [StoreConfigOption; 3] = [
        StoreConfigOption::MaxSafestoreSize,
        StoreConfigOption::MaxObjectSize,
        StoreConfigOption::MaxStoredObjectCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreConfigOption::MaxSafestoreSize => "MAX_SAFESTORE_SIZE",
            StoreConfigOption::MaxObjectSize => "MAX_OBJECT_SIZE",
            StoreConfigOption::MaxStoredObjectCount => "MAX_STORED_OBJECT_COUNT",
        }
    }
}

impl fmt::Display for StoreConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
