//! Periodic re-evaluation of quarantined files.
//!
//! Each object first gets a cheap metadata rescan built from what was
//! recorded at quarantine time. Anything short of a confirmed threat falls
//! through to a full rescan of the extracted content. Objects are handled
//! independently; one failure never stops the sweep.

use crate::manager::{QuarantineManager, SHA256_KEY, THREATS_KEY};
use crate::state::QuarantineManagerState;
use safestore_storage::{ObjectHandle, StoreError};
use safestore_types::{
    threats_from_json, threats_to_json, Detection, ObjectId, RestoreReport, ThreatRecord,
};
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("scanner unavailable: {0}")]
    Unavailable(String),
    #[error("scan failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResponse {
    pub detections: Vec<Detection>,
    pub errors: Vec<String>,
}

/// Full content scanner.
pub trait ContentScanner: Send + Sync {
    fn scan(&self, fd: BorrowedFd<'_>, path: &Path) -> Result<ScanResponse, ScanError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRescanRequest {
    pub threat: ThreatRecord,
    pub file_path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRescanResponse {
    Undetected,
    Clean,
    ThreatPresent,
    NeedsFullScan,
    Failed,
}

/// Reputation or signature lookup by hash, without reading content.
pub trait MetadataRescanner: Send + Sync {
    fn rescan(&self, request: &MetadataRescanRequest) -> MetadataRescanResponse;
}

/// Totals for one sweep of the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanSummary {
    pub examined: usize,
    pub metadata_confirmed: usize,
    pub full_scans: usize,
    pub still_threats: usize,
    /// Files put back after a clean scan. A clean file that could not be
    /// restored counts under `failures` instead.
    pub restored: Vec<RestoreReport>,
    pub failures: usize,
}

#[derive(thiserror::Error, Debug)]
enum RescanError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("staging I/O: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("expected one extracted file, found {0} entries")]
    UnexpectedExtraction(usize),
    #[error("extracted entry is not a regular file")]
    NotRegularFile,
    #[error("scanner reported errors: {0:?}")]
    ScannerErrors(Vec<String>),
}

enum FullScanOutcome {
    Clean,
    Detected(Vec<Detection>),
}

pub struct RescanPipeline {
    manager: Arc<QuarantineManager>,
    metadata: Arc<dyn MetadataRescanner>,
    scanner: Arc<dyn ContentScanner>,
    staging_dir: PathBuf,
}

impl RescanPipeline {
    pub fn new(
        manager: Arc<QuarantineManager>,
        metadata: Arc<dyn MetadataRescanner>,
        scanner: Arc<dyn ContentScanner>,
    ) -> Self {
        let staging_dir = manager.config().staging_dir.clone();
        Self {
            manager,
            metadata,
            scanner,
            staging_dir,
        }
    }

    pub fn rescan_database(&self) -> RescanSummary {
        let mut summary = RescanSummary::default();
        let state = self.manager.state();
        if state != QuarantineManagerState::Initialised {
            warn!(%state, "Skipping SafeStore rescan: database not initialised");
            return summary;
        }

        let handles = self.manager.quarantined_handles();
        info!(objects = handles.len(), "Rescanning SafeStore database");
        for handle in &handles {
            self.rescan_object(handle, &mut summary);
        }
        info!(
            examined = summary.examined,
            restored = summary.restored.len(),
            still_threats = summary.still_threats,
            failures = summary.failures,
            "SafeStore rescan complete"
        );
        summary
    }

    fn rescan_object(&self, handle: &ObjectHandle, summary: &mut RescanSummary) {
        let Some(object_id) = handle.object_id() else {
            return;
        };
        summary.examined += 1;

        if let Some(request) = self.metadata_request(handle, &object_id) {
            match self.metadata.rescan(&request) {
                MetadataRescanResponse::ThreatPresent => {
                    debug!(%object_id, "Metadata rescan confirms threat");
                    summary.metadata_confirmed += 1;
                    return;
                }
                response => {
                    debug!(%object_id, ?response, "Metadata rescan inconclusive, scanning content");
                }
            }
        }

        summary.full_scans += 1;
        let outcome = self.full_rescan(&object_id);
        self.clean_staging();

        match outcome {
            Ok(FullScanOutcome::Clean) => {
                info!(%object_id, "Quarantined file is no longer a threat, restoring");
                match self.manager.restore_file(&object_id.to_string()) {
                    Some(report) if report.was_successful => summary.restored.push(report),
                    _ => summary.failures += 1,
                }
            }
            Ok(FullScanOutcome::Detected(detections)) => {
                summary.still_threats += 1;
                self.update_threats(handle, &object_id, &detections);
            }
            Err(err) => {
                warn!(%object_id, "Full rescan failed, keeping file quarantined: {}", err);
                summary.failures += 1;
            }
        }
    }

    fn metadata_request(
        &self,
        handle: &ObjectHandle,
        object_id: &ObjectId,
    ) -> Option<MetadataRescanRequest> {
        let store = self.manager.store();

        let Some(name) = store.get_object_name(handle) else {
            warn!(%object_id, "Metadata rescan unavailable: missing name");
            return None;
        };
        let Some(location) = store.get_object_location(handle) else {
            warn!(%object_id, "Metadata rescan unavailable: missing location");
            return None;
        };
        let sha256 = match store.get_custom_data_string(handle, SHA256_KEY) {
            Ok(Some(sha256)) if !sha256.is_empty() => sha256,
            _ => {
                warn!(%object_id, "Metadata rescan unavailable: missing SHA256");
                return None;
            }
        };
        let raw = match store.get_custom_data_string(handle, THREATS_KEY) {
            Ok(Some(raw)) => raw,
            _ => {
                warn!(%object_id, "Metadata rescan unavailable: missing threats");
                return None;
            }
        };
        let threats = match threats_from_json(&raw) {
            Ok(threats) => threats,
            Err(err) => {
                warn!(%object_id, "Metadata rescan unavailable: malformed threats: {}", err);
                return None;
            }
        };
        let Some(first) = threats.first() else {
            warn!(%object_id, "Metadata rescan unavailable: empty threats");
            return None;
        };
        if !threats.iter().all(ThreatRecord::has_sha256) {
            warn!(%object_id, "Metadata rescan unavailable: threat without sha256");
            return None;
        }

        Some(MetadataRescanRequest {
            threat: first.clone(),
            file_path: location.join(name),
            sha256,
        })
    }

    fn full_rescan(&self, object_id: &ObjectId) -> Result<FullScanOutcome, RescanError> {
        self.clean_staging();
        fs::create_dir_all(&self.staging_dir)?;
        self.manager
            .store()
            .restore_object_by_id_to_location(object_id, &self.staging_dir)?;

        let entries = fs::read_dir(&self.staging_dir)?.collect::<Result<Vec<_>, _>>()?;
        let [entry] = entries.as_slice() else {
            return Err(RescanError::UnexpectedExtraction(entries.len()));
        };
        if !entry.file_type()?.is_file() {
            return Err(RescanError::NotRegularFile);
        }

        let path = entry.path();
        let file = File::open(&path)?;
        let response = self.scanner.scan(file.as_fd(), &path)?;
        if !response.errors.is_empty() {
            return Err(RescanError::ScannerErrors(response.errors));
        }
        if response.detections.is_empty() {
            Ok(FullScanOutcome::Clean)
        } else {
            Ok(FullScanOutcome::Detected(response.detections))
        }
    }

    fn update_threats(&self, handle: &ObjectHandle, object_id: &ObjectId, detections: &[Detection]) {
        let threats: Vec<ThreatRecord> = detections.iter().map(ThreatRecord::from).collect();
        let json = match threats_to_json(&threats) {
            Ok(json) => json,
            Err(err) => {
                warn!(%object_id, "Failed to encode updated threats: {}", err);
                return;
            }
        };
        match self
            .manager
            .store()
            .set_custom_data_string(handle, THREATS_KEY, &json)
        {
            Ok(()) => debug!(%object_id, threats = threats.len(), "Updated threats after rescan"),
            Err(err) => warn!(%object_id, "Failed to update threats after rescan: {}", err),
        }
    }

    fn clean_staging(&self) {
        match fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.staging_dir.display(),
                "Failed to clean rescan staging directory: {}",
                err
            ),
        }
    }
}
