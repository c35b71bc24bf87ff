//! Sled-backed implementation of [`ObjectStore`].
//!
//! Layout inside `<db_dir>/<db_name>`:
//!
//! | tree      | key                  | value                         |
//! |-----------|----------------------|-------------------------------|
//! | `objects` | object id            | JSON [`ObjectRecord`]         |
//! | `content` | object id            | sealed file bytes             |
//! | `custom`  | object id ‖ key      | UTF-8 custom data             |
//! | `config`  | option name          | big-endian `u64`              |
//! | `meta`    | `format_version`, `key_check` | store bookkeeping    |

use crate::disk;
use crate::record::{ObjectRecord, SearchFilter};
use crate::seal::ContentSealer;
use crate::{lock_dir_for, ObjectHandle, ObjectStore, StoreError, StoreResult};
use parking_lot::RwLock;
use safestore_types::{
    InitReturnCode, ObjectId, ObjectStatus, ObjectType, SaveFileReturnCode, StoreConfigOption,
    ThreatId,
};
use sled::{Db, Tree};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FORMAT_VERSION: u64 = 1;
const KEY_CHECK: &[u8] = b"safestore key check";

/// Lock directory held for as long as the database is open.
struct LockDir {
    path: PathBuf,
}

impl LockDir {
    fn acquire(path: PathBuf) -> io::Result<Self> {
        fs::create_dir(&path)?;
        Ok(Self { path })
    }
}

impl Drop for LockDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            warn!(
                path = %self.path.display(),
                "Failed to release database lock directory: {}",
                err
            );
        }
    }
}

struct OpenStore {
    db: Db,
    objects: Tree,
    content: Tree,
    custom: Tree,
    config: Tree,
    sealer: ContentSealer,
    // Declared last so it is released after every tree handle.
    _lock: LockDir,
}

impl Drop for OpenStore {
    fn drop(&mut self) {
        if let Err(err) = self.db.flush() {
            warn!("Failed to flush object store on close: {}", err);
        }
    }
}

fn decode_u64(raw: &[u8]) -> Option<u64> {
    raw.try_into().ok().map(u64::from_be_bytes)
}

fn classify_open_error(err: &sled::Error) -> InitReturnCode {
    match err {
        sled::Error::Io(io_err) if io_err.kind() == io::ErrorKind::OutOfMemory => {
            InitReturnCode::OutOfMemory
        }
        sled::Error::Io(_) => InitReturnCode::DbOpenFailed,
        sled::Error::Corruption { .. } => InitReturnCode::DbError,
        sled::Error::Unsupported(_) => InitReturnCode::UnsupportedVersion,
        _ => InitReturnCode::Failed,
    }
}

fn open_store(db_dir: &Path, db_name: &str, password: &str) -> Result<OpenStore, InitReturnCode> {
    let lock_path = lock_dir_for(db_dir, db_name);
    let lock = match LockDir::acquire(lock_path.clone()) {
        Ok(lock) => lock,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %lock_path.display(), "Object store lock directory already exists");
            return Err(InitReturnCode::DbOpenFailed);
        }
        Err(err) => {
            warn!(path = %lock_path.display(), "Unable to create lock directory: {}", err);
            return Err(InitReturnCode::Failed);
        }
    };

    let db = sled::open(db_dir.join(db_name)).map_err(|err| {
        warn!("Failed to open object store database: {}", err);
        classify_open_error(&err)
    })?;

    let open_tree = |name: &str| {
        db.open_tree(name).map_err(|err| {
            warn!(tree = name, "Failed to open object store tree: {}", err);
            InitReturnCode::DbError
        })
    };
    let objects = open_tree("objects")?;
    let content = open_tree("content")?;
    let custom = open_tree("custom")?;
    let config = open_tree("config")?;
    let meta = open_tree("meta")?;

    let db_error = |err: sled::Error| {
        warn!("Object store metadata unreadable: {}", err);
        InitReturnCode::DbError
    };

    match meta.get(b"format_version").map_err(db_error)? {
        Some(raw) => {
            let version = decode_u64(&raw);
            if version != Some(FORMAT_VERSION) {
                warn!(?version, expected = FORMAT_VERSION, "Unsupported object store format");
                return Err(InitReturnCode::UnsupportedVersion);
            }
        }
        None => {
            meta.insert(b"format_version", FORMAT_VERSION.to_be_bytes().to_vec())
                .map_err(db_error)?;
        }
    }

    let sealer = ContentSealer::from_password(password);
    match meta.get(b"key_check").map_err(db_error)? {
        Some(sealed) => {
            if sealer.open(&sealed).ok().as_deref() != Some(KEY_CHECK) {
                warn!("Object store password does not match the database");
                return Err(InitReturnCode::DbOpenFailed);
            }
        }
        None => {
            let sealed = sealer.seal(KEY_CHECK).map_err(|_| InitReturnCode::Failed)?;
            meta.insert(b"key_check", sealed).map_err(db_error)?;
        }
    }

    Ok(OpenStore {
        db,
        objects,
        content,
        custom,
        config,
        sealer,
        _lock: lock,
    })
}

impl OpenStore {
    fn load(&self, id: &ObjectId) -> StoreResult<ObjectRecord> {
        let raw = self
            .objects
            .get(id.as_bytes())?
            .ok_or(StoreError::ObjectNotFound(*id))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn put(&self, record: &ObjectRecord) -> StoreResult<()> {
        self.objects
            .insert(record.id.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn records(&self) -> StoreResult<Vec<ObjectRecord>> {
        self.objects
            .iter()
            .map(|entry| {
                let (_, raw) = entry?;
                Ok(serde_json::from_slice::<ObjectRecord>(&raw)?)
            })
            .collect()
    }

    fn custom_key(id: &ObjectId, key: &str) -> Vec<u8> {
        let mut composite = id.as_bytes().to_vec();
        composite.extend_from_slice(key.as_bytes());
        composite
    }

    fn config_value(&self, option: StoreConfigOption) -> StoreResult<Option<u64>> {
        Ok(self
            .config
            .get(option.as_str())?
            .and_then(|raw| decode_u64(&raw)))
    }

    fn check_limits(&self, size: u64) -> StoreResult<Option<SaveFileReturnCode>> {
        if let Some(max) = self.config_value(StoreConfigOption::MaxObjectSize)? {
            if size > max {
                return Ok(Some(SaveFileReturnCode::MaxObjectSizeExceeded));
            }
        }
        if let Some(max) = self.config_value(StoreConfigOption::MaxStoredObjectCount)? {
            if self.objects.len() as u64 >= max {
                return Ok(Some(SaveFileReturnCode::MaxStoreSizeExceeded));
            }
        }
        if let Some(max) = self.config_value(StoreConfigOption::MaxSafestoreSize)? {
            let used: u64 = self.records()?.iter().map(|r| r.size).sum();
            if used.saturating_add(size) > max {
                return Ok(Some(SaveFileReturnCode::MaxStoreSizeExceeded));
            }
        }
        Ok(None)
    }

    fn insert(&self, record: &ObjectRecord, sealed: Vec<u8>) -> StoreResult<()> {
        self.content.insert(record.id.as_bytes(), sealed)?;
        if let Err(err) = self.put(record) {
            let _ = self.content.remove(record.id.as_bytes());
            return Err(err);
        }
        Ok(())
    }

    fn restore_into(
        &self,
        id: &ObjectId,
        directory: &Path,
        track_status: bool,
    ) -> StoreResult<PathBuf> {
        let mut record = self.load(id)?;
        if !matches!(
            record.status,
            ObjectStatus::Quarantined | ObjectStatus::RestoreFailed
        ) {
            return Err(StoreError::InvalidStatus {
                id: *id,
                actual: record.status,
                expected: ObjectStatus::Quarantined,
            });
        }

        let sealed = self
            .content
            .get(id.as_bytes())?
            .ok_or(StoreError::Integrity(*id))?;
        let plaintext = self
            .sealer
            .open(&sealed)
            .map_err(|_| StoreError::Integrity(*id))?;
        if disk::sha256_hex(&plaintext) != record.digest {
            return Err(StoreError::Integrity(*id));
        }

        let result = disk::write_restored(
            directory,
            &record.name,
            &plaintext,
            record.mode,
            record.uid,
            record.gid,
        );

        if track_status {
            record.status = if result.is_ok() {
                ObjectStatus::Restored
            } else {
                ObjectStatus::RestoreFailed
            };
            if let Err(err) = self.put(&record) {
                warn!(object_id = %id, "Failed to record restore status: {}", err);
            }
        }
        result
    }

    fn remove(&self, id: &ObjectId) -> StoreResult<()> {
        if self.objects.remove(id.as_bytes())?.is_none() {
            return Err(StoreError::ObjectNotFound(*id));
        }
        self.content.remove(id.as_bytes())?;
        for entry in self.custom.scan_prefix(id.as_bytes()) {
            let (key, _) = entry?;
            self.custom.remove(key)?;
        }
        Ok(())
    }
}

/// Object store persisted in an embedded sled database.
pub struct SledObjectStore {
    inner: RwLock<Option<OpenStore>>,
}

impl SledObjectStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().is_some()
    }

    fn with_open<T>(&self, f: impl FnOnce(&OpenStore) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.inner.read();
        let store = guard.as_ref().ok_or(StoreError::NotInitialised)?;
        f(store)
    }
}

impl Default for SledObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for SledObjectStore {
    fn initialise(&self, db_dir: &Path, db_name: &str, password: &str) -> InitReturnCode {
        if db_name.is_empty() || password.is_empty() || !db_dir.is_absolute() {
            warn!("Object store initialise called with invalid arguments");
            return InitReturnCode::InvalidArg;
        }
        if !db_dir.is_dir() {
            warn!(path = %db_dir.display(), "Object store directory does not exist");
            return InitReturnCode::InvalidArg;
        }

        let mut guard = self.inner.write();
        if guard.is_some() {
            debug!("Object store already open");
            return InitReturnCode::Ok;
        }

        match open_store(db_dir, db_name, password) {
            Ok(store) => {
                *guard = Some(store);
                info!(path = %db_dir.join(db_name).display(), "Opened object store");
                InitReturnCode::Ok
            }
            Err(code) => code,
        }
    }

    fn close(&self) {
        let store = self.inner.write().take();
        if store.is_some() {
            drop(store);
            info!("Closed object store");
        }
    }

    fn save_file(
        &self,
        directory: &Path,
        filename: &OsStr,
        threat_id: &ThreatId,
        threat_name: &str,
        handle: &mut ObjectHandle,
    ) -> SaveFileReturnCode {
        let guard = self.inner.read();
        let Some(store) = guard.as_ref() else {
            warn!("save_file called while the object store is closed");
            return SaveFileReturnCode::Failed;
        };

        if let Err(err) = disk::validate_target(directory, filename) {
            warn!("Rejecting save: {}", err);
            return SaveFileReturnCode::InvalidArg;
        }

        let source = match disk::read_source(directory, filename) {
            Ok(source) => source,
            Err(err) => {
                warn!(
                    path = %directory.join(filename).display(),
                    "Unable to read file for quarantine: {}",
                    err
                );
                return SaveFileReturnCode::FileReadFailed;
            }
        };

        let size = source.content.len() as u64;
        match store.check_limits(size) {
            Ok(Some(code)) => {
                warn!(size, "Object store limit reached: {}", code);
                return code;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Unable to evaluate object store limits: {}", err);
                return SaveFileReturnCode::DbError;
            }
        }

        let sealed = match store.sealer.seal(&source.content) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("Unable to seal file content: {}", err);
                return SaveFileReturnCode::Failed;
            }
        };

        let record = ObjectRecord {
            id: ObjectId::generate(),
            object_type: ObjectType::File,
            status: ObjectStatus::Stored,
            name: filename.to_os_string(),
            location: directory.to_path_buf(),
            threat_id: *threat_id,
            threat_name: threat_name.to_string(),
            size,
            digest: disk::sha256_hex(&source.content),
            mode: source.mode,
            uid: source.uid,
            gid: source.gid,
            stored_at: disk::now_secs(),
        };

        if let Err(err) = store.insert(&record, sealed) {
            warn!("Failed to write object to the store: {}", err);
            return SaveFileReturnCode::DbError;
        }

        handle.bind(record.id);
        debug!(object_id = %record.id, %threat_id, "Saved file into object store");
        SaveFileReturnCode::Ok
    }

    fn find(&self, filter: &SearchFilter) -> StoreResult<Vec<ObjectHandle>> {
        self.with_open(|store| {
            Ok(store
                .records()?
                .into_iter()
                .filter(|record| filter.matches(record))
                .map(|record| ObjectHandle::for_object(record.id))
                .collect())
        })
    }

    fn get_object_handle(&self, id: &ObjectId) -> StoreResult<ObjectHandle> {
        self.with_open(|store| store.load(id).map(|record| ObjectHandle::for_object(record.id)))
    }

    fn describe(&self, handle: &ObjectHandle) -> StoreResult<ObjectRecord> {
        let id = handle.require_id()?;
        self.with_open(|store| store.load(&id))
    }

    fn set_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let id = handle.require_id()?;
        self.with_open(|store| {
            store.load(&id)?;
            store
                .custom
                .insert(OpenStore::custom_key(&id, key), value.as_bytes())?;
            Ok(())
        })
    }

    fn get_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
    ) -> StoreResult<Option<String>> {
        let id = handle.require_id()?;
        self.with_open(|store| {
            store
                .custom
                .get(OpenStore::custom_key(&id, key))?
                .map(|raw| String::from_utf8(raw.to_vec()).map_err(|_| StoreError::Integrity(id)))
                .transpose()
        })
    }

    fn finalise_object(&self, handle: &ObjectHandle) -> StoreResult<()> {
        let id = handle.require_id()?;
        self.with_open(|store| {
            let mut record = store.load(&id)?;
            if record.status != ObjectStatus::Stored {
                return Err(StoreError::InvalidStatus {
                    id,
                    actual: record.status,
                    expected: ObjectStatus::Stored,
                });
            }
            record.status = ObjectStatus::Quarantined;
            store.put(&record)?;
            store.db.flush()?;
            Ok(())
        })
    }

    fn restore_object_by_id(&self, id: &ObjectId) -> StoreResult<()> {
        self.with_open(|store| {
            let location = store.load(id)?.location;
            let path = store.restore_into(id, &location, true)?;
            info!(object_id = %id, path = %path.display(), "Restored object");
            Ok(())
        })
    }

    fn restore_object_by_id_to_location(
        &self,
        id: &ObjectId,
        directory: &Path,
    ) -> StoreResult<()> {
        self.with_open(|store| {
            let path = store.restore_into(id, directory, false)?;
            debug!(object_id = %id, path = %path.display(), "Extracted object");
            Ok(())
        })
    }

    fn delete_object_by_id(&self, id: &ObjectId) -> StoreResult<()> {
        self.with_open(|store| store.remove(id))
    }

    fn delete_objects_by_threat_id(&self, threat_id: &ThreatId) -> StoreResult<usize> {
        self.with_open(|store| {
            let matching: Vec<ObjectId> = store
                .records()?
                .into_iter()
                .filter(|record| record.threat_id == *threat_id)
                .map(|record| record.id)
                .collect();
            for id in &matching {
                store.remove(id)?;
            }
            Ok(matching.len())
        })
    }

    fn get_config_int_value(&self, option: StoreConfigOption) -> StoreResult<Option<u64>> {
        self.with_open(|store| store.config_value(option))
    }

    fn set_config_int_value(&self, option: StoreConfigOption, value: u64) -> StoreResult<()> {
        self.with_open(|store| {
            store.config.insert(option.as_str(), value.to_be_bytes().to_vec())?;
            Ok(())
        })
    }
}
