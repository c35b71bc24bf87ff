//! Object store adapter for quarantined content.
//!
//! [`ObjectStore`] is the seam the quarantine engine talks to. Two backends
//! are provided: [`SledObjectStore`] persists sealed objects in an embedded
//! sled database, [`MemoryObjectStore`] keeps everything in memory and can
//! inject faults for tests.

pub mod disk;
pub mod memory;
pub mod record;
pub mod seal;
pub mod sled_store;

pub use memory::{FaultPlan, MemoryObjectStore};
pub use record::{ObjectRecord, SearchFilter};
pub use sled_store::SledObjectStore;

use safestore_types::{
    InitReturnCode, ObjectId, ObjectStatus, ObjectType, SaveFileReturnCode, StoreConfigOption,
    ThreatId,
};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object store is not initialised")]
    NotInitialised,
    #[error("object handle is not bound to a stored object")]
    UnboundHandle,
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),
    #[error("object {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: ObjectId,
        actual: ObjectStatus,
        expected: ObjectStatus,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("restore target already exists: {}", .0.display())]
    TargetExists(PathBuf),
    #[error("integrity check failed for object {0}")]
    Integrity(ObjectId),
    #[error("content sealing failed")]
    Seal,
    #[error("injected failure: {0}")]
    Injected(&'static str),
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Owned reference to one object in the store.
///
/// Handles are not `Clone`: a function either borrows a handle or takes it.
/// A freshly created handle is unbound until `save_file` (or a lookup) binds
/// it to an object id.
#[derive(Debug, Default)]
pub struct ObjectHandle {
    id: Option<ObjectId>,
}

impl ObjectHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_object(id: ObjectId) -> Self {
        Self { id: Some(id) }
    }

    /// Bind the handle to a stored object. Used by store backends.
    pub fn bind(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn require_id(&self) -> StoreResult<ObjectId> {
        self.id.ok_or(StoreError::UnboundHandle)
    }
}

/// Directory the store holds while a database is open.
///
/// A leftover directory after a crash blocks the next open until it is
/// removed.
pub fn lock_dir_for(db_dir: &Path, db_name: &str) -> PathBuf {
    db_dir.join(format!("{db_name}.lock"))
}

/// Persistent object store consumed by the quarantine engine.
pub trait ObjectStore: Send + Sync {
    /// Open (or create) the database at `db_dir/db_name`.
    fn initialise(&self, db_dir: &Path, db_name: &str, password: &str) -> InitReturnCode;

    /// Release the database, including its lock. Safe to call when closed.
    fn close(&self);

    fn create_handle(&self) -> ObjectHandle {
        ObjectHandle::new()
    }

    /// Copy `directory/filename` into the store and bind `handle` to the new
    /// object, which starts in [`ObjectStatus::Stored`].
    fn save_file(
        &self,
        directory: &Path,
        filename: &OsStr,
        threat_id: &ThreatId,
        threat_name: &str,
        handle: &mut ObjectHandle,
    ) -> SaveFileReturnCode;

    fn find(&self, filter: &SearchFilter) -> StoreResult<Vec<ObjectHandle>>;

    fn get_object_handle(&self, id: &ObjectId) -> StoreResult<ObjectHandle>;

    /// Snapshot of the object's stored fields.
    fn describe(&self, handle: &ObjectHandle) -> StoreResult<ObjectRecord>;

    fn get_object_id(&self, handle: &ObjectHandle) -> Option<ObjectId> {
        handle.object_id()
    }

    fn get_object_name(&self, handle: &ObjectHandle) -> Option<OsString> {
        self.describe(handle)
            .ok()
            .map(|record| record.name)
            .filter(|name| !name.is_empty())
    }

    fn get_object_location(&self, handle: &ObjectHandle) -> Option<PathBuf> {
        self.describe(handle)
            .ok()
            .map(|record| record.location)
            .filter(|location| !location.as_os_str().is_empty())
    }

    fn get_object_status(&self, handle: &ObjectHandle) -> Option<ObjectStatus> {
        self.describe(handle).ok().map(|record| record.status)
    }

    fn get_object_type(&self, handle: &ObjectHandle) -> Option<ObjectType> {
        self.describe(handle).ok().map(|record| record.object_type)
    }

    fn get_object_threat_id(&self, handle: &ObjectHandle) -> Option<ThreatId> {
        self.describe(handle).ok().map(|record| record.threat_id)
    }

    fn get_object_threat_name(&self, handle: &ObjectHandle) -> Option<String> {
        self.describe(handle).ok().map(|record| record.threat_name)
    }

    fn set_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
        value: &str,
    ) -> StoreResult<()>;

    fn get_custom_data_string(&self, handle: &ObjectHandle, key: &str)
        -> StoreResult<Option<String>>;

    /// Commit a stored object to [`ObjectStatus::Quarantined`].
    fn finalise_object(&self, handle: &ObjectHandle) -> StoreResult<()>;

    /// Write the object back to its original location.
    fn restore_object_by_id(&self, id: &ObjectId) -> StoreResult<()>;

    /// Write the object, under its original name, into `directory`.
    fn restore_object_by_id_to_location(&self, id: &ObjectId, directory: &Path)
        -> StoreResult<()>;

    fn delete_object_by_id(&self, id: &ObjectId) -> StoreResult<()>;

    /// Delete every object carrying `threat_id`, returning how many went.
    fn delete_objects_by_threat_id(&self, threat_id: &ThreatId) -> StoreResult<usize>;

    fn get_config_int_value(&self, option: StoreConfigOption) -> StoreResult<Option<u64>>;

    fn set_config_int_value(&self, option: StoreConfigOption, value: u64) -> StoreResult<()>;
}
