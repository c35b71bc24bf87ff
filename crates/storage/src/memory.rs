//! In-memory object store with scriptable failures.

use crate::disk;
use crate::record::{ObjectRecord, SearchFilter};
use crate::{ObjectHandle, ObjectStore, StoreError, StoreResult};
use parking_lot::{Mutex, MutexGuard, RwLock};
use safestore_types::{
    InitReturnCode, ObjectId, ObjectStatus, ObjectType, SaveFileReturnCode, StoreConfigOption,
    ThreatId,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Failures the in-memory store reports instead of doing the work.
#[derive(Debug, Default, Clone)]
pub struct FaultPlan {
    /// Codes returned by successive `initialise` calls before falling back
    /// to the real behaviour. A scripted `Ok` opens the store.
    pub init_codes: VecDeque<InitReturnCode>,
    /// Returned by every `save_file` while set.
    pub save_code: Option<SaveFileReturnCode>,
    /// Custom-data keys whose writes fail.
    pub failing_custom_keys: HashSet<String>,
    pub fail_finalise: bool,
    pub fail_restore: bool,
    pub fail_delete: bool,
}

#[derive(Default)]
struct MemoryState {
    open: bool,
    password: Option<String>,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    content: HashMap<ObjectId, Vec<u8>>,
    custom: HashMap<(ObjectId, String), String>,
    config: HashMap<StoreConfigOption, u64>,
}

impl MemoryState {
    fn require_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::NotInitialised)
        }
    }

    fn load(&self, id: &ObjectId) -> StoreResult<&ObjectRecord> {
        self.require_open()?;
        self.objects.get(id).ok_or(StoreError::ObjectNotFound(*id))
    }

    fn limit_hit(&self, size: u64) -> Option<SaveFileReturnCode> {
        let limit = |option| self.config.get(&option).copied();
        if limit(StoreConfigOption::MaxObjectSize).is_some_and(|max| size > max) {
            return Some(SaveFileReturnCode::MaxObjectSizeExceeded);
        }
        if limit(StoreConfigOption::MaxStoredObjectCount)
            .is_some_and(|max| self.objects.len() as u64 >= max)
        {
            return Some(SaveFileReturnCode::MaxStoreSizeExceeded);
        }
        let used: u64 = self.objects.values().map(|record| record.size).sum();
        if limit(StoreConfigOption::MaxSafestoreSize)
            .is_some_and(|max| used.saturating_add(size) > max)
        {
            return Some(SaveFileReturnCode::MaxStoreSizeExceeded);
        }
        None
    }

    fn remove(&mut self, id: &ObjectId) -> StoreResult<()> {
        self.require_open()?;
        if self.objects.remove(id).is_none() {
            return Err(StoreError::ObjectNotFound(*id));
        }
        self.content.remove(id);
        self.custom.retain(|(owner, _), _| owner != id);
        Ok(())
    }
}

/// Object store kept entirely in memory. Objects survive `close` so a test
/// can reinitialise and observe what was stored before.
#[derive(Default)]
pub struct MemoryObjectStore {
    state: RwLock<MemoryState>,
    faults: Mutex<FaultPlan>,
    init_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(plan: FaultPlan) -> Self {
        Self {
            faults: Mutex::new(plan),
            ..Self::default()
        }
    }

    /// Adjust the failure plan while the store is in use.
    pub fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults.lock()
    }

    /// Number of `initialise` calls seen so far.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Drop every object and setting, as if the database directory vanished.
    pub fn wipe(&self) {
        let mut state = self.state.write();
        let open = state.open;
        *state = MemoryState {
            open,
            ..MemoryState::default()
        };
    }

    fn restore_into(&self, id: &ObjectId, directory: &Path, track_status: bool) -> StoreResult<PathBuf> {
        if self.faults.lock().fail_restore {
            return Err(StoreError::Injected("restore"));
        }
        let mut state = self.state.write();
        let record = state.load(id)?.clone();
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
        let content = state
            .content
            .get(id)
            .cloned()
            .ok_or(StoreError::Integrity(*id))?;
        let result = disk::write_restored(
            directory,
            &record.name,
            &content,
            record.mode,
            record.uid,
            record.gid,
        );
        if track_status {
            if let Some(stored) = state.objects.get_mut(id) {
                stored.status = if result.is_ok() {
                    ObjectStatus::Restored
                } else {
                    ObjectStatus::RestoreFailed
                };
            }
        }
        result
    }
}

impl ObjectStore for MemoryObjectStore {
    fn initialise(&self, db_dir: &Path, db_name: &str, password: &str) -> InitReturnCode {
        self.init_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.faults.lock().init_codes.pop_front();
        if let Some(code) = scripted {
            debug!(%code, "Returning scripted initialise result");
            if code == InitReturnCode::Ok {
                self.state.write().open = true;
            }
            return code;
        }

        if db_name.is_empty() || password.is_empty() || !db_dir.is_absolute() {
            return InitReturnCode::InvalidArg;
        }

        let mut state = self.state.write();
        match &state.password {
            Some(existing) if existing != password => return InitReturnCode::DbOpenFailed,
            Some(_) => {}
            None => state.password = Some(password.to_string()),
        }
        state.open = true;
        InitReturnCode::Ok
    }

    fn close(&self) {
        self.state.write().open = false;
    }

    fn save_file(
        &self,
        directory: &Path,
        filename: &OsStr,
        threat_id: &ThreatId,
        threat_name: &str,
        handle: &mut ObjectHandle,
    ) -> SaveFileReturnCode {
        if let Some(code) = self.faults.lock().save_code {
            return code;
        }
        if !self.is_open() {
            return SaveFileReturnCode::Failed;
        }
        if disk::validate_target(directory, filename).is_err() {
            return SaveFileReturnCode::InvalidArg;
        }
        let source = match disk::read_source(directory, filename) {
            Ok(source) => source,
            Err(_) => return SaveFileReturnCode::FileReadFailed,
        };

        let mut state = self.state.write();
        let size = source.content.len() as u64;
        if let Some(code) = state.limit_hit(size) {
            return code;
        }

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
        handle.bind(record.id);
        state.content.insert(record.id, source.content);
        state.objects.insert(record.id, record);
        SaveFileReturnCode::Ok
    }

    fn find(&self, filter: &SearchFilter) -> StoreResult<Vec<ObjectHandle>> {
        let state = self.state.read();
        state.require_open()?;
        Ok(state
            .objects
            .values()
            .filter(|record| filter.matches(record))
            .map(|record| ObjectHandle::for_object(record.id))
            .collect())
    }

    fn get_object_handle(&self, id: &ObjectId) -> StoreResult<ObjectHandle> {
        let state = self.state.read();
        state.load(id).map(|record| ObjectHandle::for_object(record.id))
    }

    fn describe(&self, handle: &ObjectHandle) -> StoreResult<ObjectRecord> {
        let id = handle.require_id()?;
        self.state.read().load(&id).cloned()
    }

    fn set_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        if self.faults.lock().failing_custom_keys.contains(key) {
            return Err(StoreError::Injected("custom data"));
        }
        let id = handle.require_id()?;
        let mut state = self.state.write();
        state.load(&id)?;
        state.custom.insert((id, key.to_string()), value.to_string());
        Ok(())
    }

    fn get_custom_data_string(
        &self,
        handle: &ObjectHandle,
        key: &str,
    ) -> StoreResult<Option<String>> {
        let id = handle.require_id()?;
        let state = self.state.read();
        state.require_open()?;
        Ok(state.custom.get(&(id, key.to_string())).cloned())
    }

    fn finalise_object(&self, handle: &ObjectHandle) -> StoreResult<()> {
        if self.faults.lock().fail_finalise {
            return Err(StoreError::Injected("finalise"));
        }
        let id = handle.require_id()?;
        let mut state = self.state.write();
        state.require_open()?;
        let record = state
            .objects
            .get_mut(&id)
            .ok_or(StoreError::ObjectNotFound(id))?;
        if record.status != ObjectStatus::Stored {
            return Err(StoreError::InvalidStatus {
                id,
                actual: record.status,
                expected: ObjectStatus::Stored,
            });
        }
        record.status = ObjectStatus::Quarantined;
        Ok(())
    }

    fn restore_object_by_id(&self, id: &ObjectId) -> StoreResult<()> {
        let location = self.state.read().load(id)?.location.clone();
        self.restore_into(id, &location, true).map(|_| ())
    }

    fn restore_object_by_id_to_location(
        &self,
        id: &ObjectId,
        directory: &Path,
    ) -> StoreResult<()> {
        self.restore_into(id, directory, false).map(|_| ())
    }

    fn delete_object_by_id(&self, id: &ObjectId) -> StoreResult<()> {
        if self.faults.lock().fail_delete {
            return Err(StoreError::Injected("delete"));
        }
        self.state.write().remove(id)
    }

    fn delete_objects_by_threat_id(&self, threat_id: &ThreatId) -> StoreResult<usize> {
        if self.faults.lock().fail_delete {
            return Err(StoreError::Injected("delete"));
        }
        let mut state = self.state.write();
        state.require_open()?;
        let matching: Vec<ObjectId> = state
            .objects
            .values()
            .filter(|record| record.threat_id == *threat_id)
            .map(|record| record.id)
            .collect();
        for id in &matching {
            state.remove(id)?;
        }
        Ok(matching.len())
    }

    fn get_config_int_value(&self, option: StoreConfigOption) -> StoreResult<Option<u64>> {
        let state = self.state.read();
        state.require_open()?;
        Ok(state.config.get(&option).copied())
    }

    fn set_config_int_value(&self, option: StoreConfigOption, value: u64) -> StoreResult<()> {
        let mut state = self.state.write();
        state.require_open()?;
        state.config.insert(option, value);
        Ok(())
    }
}
