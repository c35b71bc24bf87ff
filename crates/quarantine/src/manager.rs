//! Quarantine orchestration: taking custody of files, restoring them and
//! keeping track of the database's health.

use crate::config::QuarantineConfig;
use crate::dormant::DormantFlag;
use crate::file_identity::{DirHandle, IdentityCheck};
use crate::state::{
    load_error_threshold, store_error_threshold, HealthTracker, QuarantineHealth,
    QuarantineManagerState,
};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use safestore_storage::{lock_dir_for, ObjectHandle, ObjectStore, SearchFilter};
use safestore_types::{
    threats_to_json, CorrelationId, InitReturnCode, ObjectId, ObjectStatus, QuarantineResult,
    RestoreReport, SaveFileReturnCode, StoreConfigOption, ThreatId, ThreatRecord,
};
use serde::Serialize;
use std::ffi::OsStr;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Custom data key holding the hex SHA-256 of the quarantined content.
pub const SHA256_KEY: &str = "SHA256";
/// Custom data key holding the JSON threat list.
pub const THREATS_KEY: &str = "threats";
/// Custom data key holding the detection report's correlation id.
pub const CORRELATION_ID_KEY: &str = "correlationId";

const PASSWORD_BYTES: usize = 32;

/// A detection the agent wants quarantined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineRequest {
    pub path: PathBuf,
    pub threat_id: String,
    pub threat_type: String,
    pub threat_name: String,
    pub threat_sha256: String,
    pub content_sha256: String,
    pub correlation_id: String,
}

/// One quarantined file as listed to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedObjectSummary {
    pub object_id: ObjectId,
    pub name: String,
    pub location: PathBuf,
    pub threat_id: ThreatId,
    pub threat_name: String,
    pub correlation_id: Option<String>,
}

pub struct QuarantineManager {
    config: QuarantineConfig,
    store: Arc<dyn ObjectStore>,
    health: Mutex<HealthTracker>,
    dormant: DormantFlag,
}

impl QuarantineManager {
    pub fn new(config: QuarantineConfig, store: Arc<dyn ObjectStore>) -> Self {
        let threshold = load_error_threshold(&config.error_threshold_path);
        let dormant = DormantFlag::new(config.dormant_flag_path.clone());
        Self {
            config,
            store,
            health: Mutex::new(HealthTracker::new(threshold)),
            dormant,
        }
    }

    pub fn config(&self) -> &QuarantineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn state(&self) -> QuarantineManagerState {
        self.health.lock().state()
    }

    pub fn health(&self) -> QuarantineHealth {
        let health = self.health.lock();
        QuarantineHealth {
            state: health.state(),
            consecutive_errors: health.consecutive_errors(),
            error_threshold: health.threshold(),
            dormant_reason: self.dormant.current(),
        }
    }

    pub fn error_threshold(&self) -> u32 {
        self.health.lock().threshold()
    }

    /// Persist a new consecutive-error threshold and apply it immediately.
    pub fn set_error_threshold(&self, threshold: u32) -> io::Result<()> {
        store_error_threshold(&self.config.error_threshold_path, threshold)?;
        self.health.lock().set_threshold(threshold);
        Ok(())
    }

    /// Open the object store unless it is already open.
    ///
    /// Returns whether the manager is initialised afterwards.
    pub fn initialise(&self) -> bool {
        let mut health = self.health.lock();
        if health.state() == QuarantineManagerState::Initialised {
            return true;
        }

        let password = match self
            .prepare_database_dir()
            .and_then(|_| self.load_or_create_password())
        {
            Ok(password) => password,
            Err(err) => {
                error!("Unable to prepare SafeStore database: {}", err);
                health.record_transient();
                self.raise_dormant(health.state());
                return false;
            }
        };

        let code = self.store.initialise(
            &self.config.database_dir,
            &self.config.database_name,
            &password,
        );

        match code {
            InitReturnCode::Ok => {
                health.record_success();
                self.dormant.clear();
                self.apply_store_limits();
                info!("SafeStore database initialised");
                true
            }
            code if code.is_transient() => {
                warn!(%code, "SafeStore initialisation failed, will retry");
                health.record_transient();
                self.raise_dormant(health.state());
                false
            }
            code => {
                let state = health.record_failure();
                warn!(
                    %code,
                    %state,
                    consecutive_errors = health.consecutive_errors(),
                    threshold = health.threshold(),
                    "SafeStore initialisation failed"
                );
                self.raise_dormant(state);
                false
            }
        }
    }

    /// Close the store. The manager must be initialised again before use.
    pub fn close(&self) {
        let mut health = self.health.lock();
        self.store.close();
        health.mark_closed();
        self.raise_dormant(health.state());
    }

    /// Remove and recreate the database directory.
    ///
    /// Refused while the database is in use. Returns `true` when there was
    /// nothing to delete.
    pub fn delete_database(&self) -> bool {
        let mut health = self.health.lock();
        if health.state() == QuarantineManagerState::Initialised {
            warn!("Refusing to delete an initialised SafeStore database");
            return false;
        }

        let dir = &self.config.database_dir;
        if !dir.exists() {
            debug!(path = %dir.display(), "SafeStore database directory absent, nothing to delete");
            return true;
        }

        self.store.close();
        if let Err(err) = fs::remove_dir_all(dir) {
            error!(path = %dir.display(), "Failed to remove SafeStore database: {}", err);
            return false;
        }
        if let Err(err) = self.prepare_database_dir() {
            error!(path = %dir.display(), "Failed to recreate SafeStore database directory: {}", err);
            return false;
        }

        health.reset();
        self.raise_dormant(health.state());
        info!(path = %dir.display(), "Deleted SafeStore database");
        true
    }

    /// Remove a leftover store lock directory. Returns whether one existed.
    pub fn remove_stale_lock(&self) -> bool {
        let lock = lock_dir_for(&self.config.database_dir, &self.config.database_name);
        if !lock.is_dir() {
            return false;
        }
        match fs::remove_dir_all(&lock) {
            Ok(()) => {
                info!(path = %lock.display(), "Removed stale SafeStore lock directory");
                true
            }
            Err(err) => {
                warn!(path = %lock.display(), "Unable to remove SafeStore lock directory: {}", err);
                false
            }
        }
    }

    /// Move the file behind `fd`, currently named `request.path`, into the
    /// store and unlink it.
    pub fn quarantine(&self, request: &QuarantineRequest, fd: BorrowedFd<'_>) -> QuarantineResult {
        let path = &request.path;

        let threat_id = match ThreatId::parse(&request.threat_id) {
            Ok(id) => id,
            Err(err) => {
                error!(path = %path.display(), "Cannot quarantine: {}", err);
                return QuarantineResult::FailedToDeleteFile;
            }
        };
        let correlation_id = match CorrelationId::parse(&request.correlation_id) {
            Ok(id) => id,
            Err(err) => {
                error!(path = %path.display(), "Cannot quarantine: {}", err);
                return QuarantineResult::FailedToDeleteFile;
            }
        };

        let state = self.state();
        if state != QuarantineManagerState::Initialised {
            warn!(path = %path.display(), %state, "Cannot quarantine: SafeStore is not initialised");
            return QuarantineResult::FailedToDeleteFile;
        }

        let Some((directory, filename)) = split_path(path) else {
            warn!(path = %path.display(), "Cannot quarantine: no parent directory");
            return QuarantineResult::NotFound;
        };

        let dir = match DirHandle::open(directory) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(path = %directory.display(), "Cannot open directory for quarantine: {}", err);
                return QuarantineResult::NotFound;
            }
        };

        match dir.verify(filename, fd) {
            Ok(IdentityCheck::Matches) => {}
            Ok(check) => {
                warn!(path = %path.display(), ?check, "File changed since it was scanned, not quarantining");
                return QuarantineResult::NotFound;
            }
            Err(err) => {
                warn!(path = %path.display(), "Unable to check file identity: {}", err);
                return QuarantineResult::NotFound;
            }
        }

        let mut handle = self.store.create_handle();
        let code = self.store.save_file(
            directory,
            filename,
            &threat_id,
            &request.threat_name,
            &mut handle,
        );
        match code {
            SaveFileReturnCode::Ok => self.note_store_success(),
            SaveFileReturnCode::DbError => {
                error!(path = %path.display(), %code, "Failed to save file into SafeStore");
                self.note_store_failure();
                return QuarantineResult::FailedToDeleteFile;
            }
            code => {
                error!(path = %path.display(), %code, "Failed to save file into SafeStore");
                return QuarantineResult::FailedToDeleteFile;
            }
        }
        let object_id = match handle.object_id() {
            Some(id) => id,
            None => {
                error!(path = %path.display(), "SafeStore saved the file without an object id");
                return QuarantineResult::FailedToDeleteFile;
            }
        };

        if let Err(err) =
            self.store
                .set_custom_data_string(&handle, SHA256_KEY, &request.content_sha256)
        {
            warn!(%object_id, "Failed to store content hash: {}", err);
        }

        let threats = [ThreatRecord::new(
            request.threat_type.clone(),
            request.threat_name.clone(),
            request.threat_sha256.clone(),
        )];
        match threats_to_json(&threats) {
            Ok(json) => {
                if let Err(err) = self.store.set_custom_data_string(&handle, THREATS_KEY, &json) {
                    warn!(%object_id, "Failed to store threat list: {}", err);
                }
            }
            Err(err) => warn!(%object_id, "Failed to encode threat list: {}", err),
        }

        if let Err(err) = self.store.set_custom_data_string(
            &handle,
            CORRELATION_ID_KEY,
            &correlation_id.to_string(),
        ) {
            error!(%object_id, "Failed to store correlation id: {}", err);
            self.discard(handle);
            return QuarantineResult::FailedToDeleteFile;
        }

        if let Err(err) = self.store.finalise_object(&handle) {
            error!(%object_id, "Failed to finalise quarantined object: {}", err);
            self.discard(handle);
            return QuarantineResult::FailedToDeleteFile;
        }
        debug!(%object_id, %threat_id, "Finalised quarantined object");

        self.delete_older_objects(&threat_id, &object_id);

        match dir.verify(filename, fd) {
            Ok(IdentityCheck::Matches) => match dir.unlink(filename) {
                Ok(()) => {
                    info!(%object_id, path = %path.display(), "Quarantined file");
                    QuarantineResult::Success
                }
                Err(err) => {
                    error!(%object_id, path = %path.display(), "Failed to delete quarantined file: {}", err);
                    QuarantineResult::FailedToDeleteFile
                }
            },
            Ok(IdentityCheck::AlreadyDeleted) => {
                info!(%object_id, path = %path.display(), "Quarantined file that was already deleted");
                QuarantineResult::Success
            }
            Ok(check) => {
                warn!(%object_id, path = %path.display(), ?check, "File changed during quarantine, leaving it in place");
                QuarantineResult::NotFound
            }
            Err(err) => {
                warn!(%object_id, path = %path.display(), "Unable to re-check file identity: {}", err);
                QuarantineResult::NotFound
            }
        }
    }

    /// Put a quarantined object back where it came from and drop it from the
    /// store. `None` when the object cannot be identified well enough to
    /// report on.
    pub fn restore_file(&self, object_id: &str) -> Option<RestoreReport> {
        let id = match ObjectId::parse(object_id) {
            Ok(id) => id,
            Err(err) => {
                error!("Cannot restore: {}", err);
                return None;
            }
        };

        let handle = match self.store.get_object_handle(&id) {
            Ok(handle) => handle,
            Err(err) => {
                error!(object_id = %id, "Cannot restore: {}", err);
                return None;
            }
        };

        let Some(name) = self.store.get_object_name(&handle) else {
            error!(object_id = %id, "Cannot restore: object has no name");
            return None;
        };
        let Some(location) = self.store.get_object_location(&handle) else {
            error!(object_id = %id, "Cannot restore: object has no location");
            return None;
        };

        let correlation_id = match self.store.get_custom_data_string(&handle, CORRELATION_ID_KEY) {
            Ok(Some(raw)) if !raw.is_empty() => match CorrelationId::parse(&raw) {
                Ok(correlation_id) => correlation_id,
                Err(err) => {
                    warn!(object_id = %id, "Cannot restore: {}", err);
                    return None;
                }
            },
            Ok(_) => {
                warn!(object_id = %id, "Cannot restore: object has no correlation id");
                return None;
            }
            Err(err) => {
                warn!(object_id = %id, "Cannot restore: unable to read correlation id: {}", err);
                return None;
            }
        };

        let path = location.join(&name);
        if let Err(err) = self.store.restore_object_by_id(&id) {
            warn!(object_id = %id, path = %path.display(), "Failed to restore object: {}", err);
            return Some(RestoreReport {
                path,
                correlation_id,
                was_successful: false,
            });
        }
        info!(object_id = %id, path = %path.display(), "Restored file from SafeStore");

        if let Err(err) = self.store.delete_object_by_id(&id) {
            warn!(object_id = %id, "Restored object could not be removed from SafeStore: {}", err);
        }

        Some(RestoreReport {
            path,
            correlation_id,
            was_successful: true,
        })
    }

    /// Handles of every file object still held in quarantine.
    pub fn quarantined_handles(&self) -> Vec<ObjectHandle> {
        match self.store.find(&SearchFilter::files()) {
            Ok(handles) => handles
                .into_iter()
                .filter(|handle| {
                    matches!(
                        self.store.get_object_status(handle),
                        Some(ObjectStatus::Quarantined | ObjectStatus::RestoreFailed)
                    )
                })
                .collect(),
            Err(err) => {
                warn!("Unable to search SafeStore: {}", err);
                Vec::new()
            }
        }
    }

    pub fn list_quarantined(&self) -> Vec<QuarantinedObjectSummary> {
        self.quarantined_handles()
            .iter()
            .filter_map(|handle| {
                let record = match self.store.describe(handle) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!("Unable to describe quarantined object: {}", err);
                        return None;
                    }
                };
                let correlation_id = self
                    .store
                    .get_custom_data_string(handle, CORRELATION_ID_KEY)
                    .ok()
                    .flatten();
                Some(QuarantinedObjectSummary {
                    object_id: record.id,
                    name: record.name.to_string_lossy().into_owned(),
                    location: record.location,
                    threat_id: record.threat_id,
                    threat_name: record.threat_name,
                    correlation_id,
                })
            })
            .collect()
    }

    fn note_store_success(&self) {
        let mut health = self.health.lock();
        if health.state() == QuarantineManagerState::Initialised {
            health.record_success();
        }
    }

    fn note_store_failure(&self) {
        let mut health = self.health.lock();
        let state = health.record_failure();
        if state == QuarantineManagerState::Corrupt {
            error!(
                consecutive_errors = health.consecutive_errors(),
                "SafeStore database marked corrupt"
            );
            self.store.close();
            self.raise_dormant(state);
        }
    }

    fn discard(&self, handle: ObjectHandle) {
        let Some(id) = handle.object_id() else {
            return;
        };
        if let Err(err) = self.store.delete_object_by_id(&id) {
            warn!(object_id = %id, "Failed to discard unfinalised object: {}", err);
        }
    }

    fn delete_older_objects(&self, threat_id: &ThreatId, keep: &ObjectId) {
        let handles = match self
            .store
            .find(&SearchFilter::files().with_threat_id(*threat_id))
        {
            Ok(handles) => handles,
            Err(err) => {
                warn!(%threat_id, "Unable to look up older objects for threat: {}", err);
                return;
            }
        };
        for id in handles.iter().filter_map(ObjectHandle::object_id) {
            if id == *keep {
                continue;
            }
            match self.store.delete_object_by_id(&id) {
                Ok(()) => debug!(object_id = %id, %threat_id, "Deleted superseded object"),
                Err(err) => warn!(object_id = %id, "Failed to delete superseded object: {}", err),
            }
        }
    }

    fn apply_store_limits(&self) {
        let limits = [
            (StoreConfigOption::MaxObjectSize, self.config.max_object_size),
            (StoreConfigOption::MaxSafestoreSize, self.config.max_store_size),
            (
                StoreConfigOption::MaxStoredObjectCount,
                self.config.max_stored_object_count,
            ),
        ];
        for (option, value) in limits {
            let Some(value) = value else { continue };
            if let Err(err) = self.store.set_config_int_value(option, value) {
                warn!(%option, value, "Failed to apply SafeStore limit: {}", err);
            }
        }
    }

    fn raise_dormant(&self, state: QuarantineManagerState) {
        match state.dormant_reason() {
            Some(reason) => self.dormant.raise(reason),
            None => self.dormant.clear(),
        }
    }

    fn prepare_database_dir(&self) -> io::Result<()> {
        let dir = &self.config.database_dir;
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, Permissions::from_mode(self.config.database_mode))?;
        if self.config.database_uid.is_some() || self.config.database_gid.is_some() {
            std::os::unix::fs::chown(dir, self.config.database_uid, self.config.database_gid)?;
        }
        Ok(())
    }

    fn load_or_create_password(&self) -> io::Result<String> {
        let path = &self.config.password_file;
        match fs::read_to_string(path) {
            Ok(raw) if !raw.trim().is_empty() => return Ok(raw.trim().to_string()),
            Ok(_) => warn!(path = %path.display(), "SafeStore password file is empty, regenerating"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let mut bytes = [0u8; PASSWORD_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let password = hex::encode(bytes);
        write_secret(path, &password)?;
        info!(path = %path.display(), "Generated SafeStore database password");
        Ok(password)
    }
}

fn write_secret(path: &Path, secret: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret.as_bytes())?;
    file.sync_all()?;
    fs::set_permissions(path, Permissions::from_mode(0o600))
}

/// Split an absolute file path into its directory and final component.
fn split_path(path: &Path) -> Option<(&Path, &OsStr)> {
    if !path.is_absolute() {
        return None;
    }
    let directory = path.parent()?;
    let filename = path.file_name()?;
    Some((directory, filename))
}
