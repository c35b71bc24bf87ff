//! Shared fixtures for the quarantine engine tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use safestore_quarantine::{QuarantineConfig, QuarantineManager, QuarantineRequest};
use safestore_storage::{
    MemoryObjectStore, ObjectHandle, ObjectRecord, ObjectStore, SearchFilter, SledObjectStore,
    StoreResult,
};
use safestore_types::{InitReturnCode, ObjectId, SaveFileReturnCode, StoreConfigOption, ThreatId};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const THREAT_ID: &str = "00000000-0000-0000-0000-000000000000";
pub const CORRELATION_ID: &str = "fedcba98-7654-3210-fedc-ba9876543210";
pub const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

pub struct Fixture<S> {
    pub manager: Arc<QuarantineManager>,
    pub store: Arc<S>,
    pub files: PathBuf,
    // Dropped last so the store closes before its directory disappears.
    pub root: TempDir,
}

impl<S: ObjectStore + 'static> Fixture<S> {
    fn with_store(store: S, configure: impl FnOnce(&mut QuarantineConfig)) -> Self {
        let root = TempDir::new().expect("temp dir");
        let files = root.path().join("files");
        fs::create_dir_all(&files).expect("files dir");

        let mut config = QuarantineConfig::rooted_at(root.path());
        config.monitor_initial_backoff_secs = 1;
        config.monitor_max_backoff_secs = 1;
        configure(&mut config);

        let store = Arc::new(store);
        let manager = Arc::new(QuarantineManager::new(
            config,
            store.clone() as Arc<dyn ObjectStore>,
        ));
        Self {
            manager,
            store,
            files,
            root,
        }
    }

    pub fn config(&self) -> &QuarantineConfig {
        self.manager.config()
    }

    /// Create a file under `files/` and open it the way the scanner would.
    pub fn scanned_file(&self, name: &str, content: &[u8]) -> (PathBuf, File) {
        let path = self.files.join(name);
        fs::write(&path, content).expect("write file");
        let file = File::open(&path).expect("open file");
        (path, file)
    }
}

pub fn memory_fixture() -> Fixture<MemoryObjectStore> {
    Fixture::with_store(MemoryObjectStore::new(), |_| {})
}

pub fn memory_fixture_with(store: MemoryObjectStore) -> Fixture<MemoryObjectStore> {
    Fixture::with_store(store, |_| {})
}

pub fn fixture_with<S: ObjectStore + 'static>(store: S) -> Fixture<S> {
    Fixture::with_store(store, |_| {})
}

pub fn sled_fixture() -> Fixture<SledObjectStore> {
    Fixture::with_store(SledObjectStore::new(), |_| {})
}

pub fn sled_fixture_with(configure: impl FnOnce(&mut QuarantineConfig)) -> Fixture<SledObjectStore> {
    Fixture::with_store(SledObjectStore::new(), configure)
}

pub fn request(path: &Path) -> QuarantineRequest {
    QuarantineRequest {
        path: path.to_path_buf(),
        threat_id: THREAT_ID.to_string(),
        threat_type: "virus".to_string(),
        threat_name: "EICAR-AV-Test".to_string(),
        threat_sha256: "494aa3ae3ffd9a1b5a0e2a7f6fc4f5b1e0b0cc2d3e4f5a6b7c8d9e0f1a2b3c4d".to_string(),
        content_sha256: "SHA256abcdef".to_string(),
        correlation_id: CORRELATION_ID.to_string(),
    }
}

type ExtractHook = Box<dyn Fn(&Path) + Send + Sync>;

/// Memory store that lets a test act on the filesystem in the middle of an
/// operation: right after `save_file`, or after an object is written into a
/// directory other than its own.
pub struct HookedStore {
    pub inner: MemoryObjectStore,
    after_save: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    after_extract: Mutex<Option<ExtractHook>>,
}

impl HookedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            after_save: Mutex::new(None),
            after_extract: Mutex::new(None),
        }
    }

    pub fn after_save(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_save.lock() = Some(Box::new(hook));
    }

    pub fn after_extract(&self, hook: impl Fn(&Path) + Send + Sync + 'static) {
        *self.after_extract.lock() = Some(Box::new(hook));
    }
}

impl ObjectStore for HookedStore {
    fn initialise(&self, db_dir: &Path, db_name: &str, password: &str) -> InitReturnCode {
        self.inner.initialise(db_dir, db_name, password)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn save_file(
        &self,
        directory: &Path,
        filename: &OsStr,
        threat_id: &ThreatId,
        threat_name: &str,
        handle: &mut ObjectHandle,
    ) -> SaveFileReturnCode {
        let code = self
            .inner
            .save_file(directory, filename, threat_id, threat_name, handle);
        if let Some(hook) = self.after_save.lock().take() {
            hook();
        }
        code
    }

    fn find(&self, filter: &SearchFilter) -> StoreResult<Vec<ObjectHandle>> {
        self.inner.find(filter)
    }

    fn get_object_handle(&self, id: &ObjectId) -> StoreResult<ObjectHandle> {
        self.inner.get_object_handle(id)
    }

    fn describe(&self, handle: &ObjectHandle) -> StoreResult<ObjectRecord> {
        self.inner.describe(handle)
    }

    fn set_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        self.inner.set_custom_data_string(handle, key, value)
    }

    fn get_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
    ) -> StoreResult<Option<String>> {
        self.inner.get_custom_data_string(handle, key)
    }

    fn finalise_object(&self, handle: &ObjectHandle) -> StoreResult<()> {
        self.inner.finalise_object(handle)
    }

    fn restore_object_by_id(&self, id: &ObjectId) -> StoreResult<()> {
        self.inner.restore_object_by_id(id)
    }

    fn restore_object_by_id_to_location(&self, id: &ObjectId, directory: &Path) -> StoreResult<()> {
        self.inner.restore_object_by_id_to_location(id, directory)?;
        if let Some(hook) = self.after_extract.lock().as_ref() {
            hook(directory);
        }
        Ok(())
    }

    fn delete_object_by_id(&self, id: &ObjectId) -> StoreResult<()> {
        self.inner.delete_object_by_id(id)
    }

    fn delete_objects_by_threat_id(&self, threat_id: &ThreatId) -> StoreResult<usize> {
        self.inner.delete_objects_by_threat_id(threat_id)
    }

    fn get_config_int_value(&self, option: StoreConfigOption) -> StoreResult<Option<u64>> {
        self.inner.get_config_int_value(option)
    }

    fn set_config_int_value(&self, option: StoreConfigOption, value: u64) -> StoreResult<()> {
        self.inner.set_config_int_value(option, value)
    }
}
