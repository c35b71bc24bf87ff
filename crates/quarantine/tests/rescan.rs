//! Rescan pipeline with scripted scanning collaborators.

mod common;

use common::*;
use parking_lot::Mutex;
use safestore_quarantine::{
    ContentScanner, MetadataRescanRequest, MetadataRescanResponse, MetadataRescanner,
    RescanPipeline, ScanError, ScanResponse, SHA256_KEY, THREATS_KEY,
};
use safestore_storage::{MemoryObjectStore, ObjectStore};
use safestore_types::{threats_from_json, Detection, QuarantineResult};
use std::fs;
use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct ScriptedMetadata {
    response: MetadataRescanResponse,
    requests: Mutex<Vec<MetadataRescanRequest>>,
}

impl ScriptedMetadata {
    fn new(response: MetadataRescanResponse) -> Arc<Self> {
        Arc::new(Self {
            response,
            requests: Mutex::new(Vec::new()),
        })
    }
}

impl MetadataRescanner for ScriptedMetadata {
    fn rescan(&self, request: &MetadataRescanRequest) -> MetadataRescanResponse {
        self.requests.lock().push(request.clone());
        self.response
    }
}

#[derive(Clone, Copy)]
enum Verdict {
    Clean,
    Detected(&'static str),
    Error,
    Unavailable,
}

/// Answers with `verdicts` in order, repeating the last one.
struct ScriptedScanner {
    verdicts: Vec<Verdict>,
    calls: AtomicUsize,
    seen: Mutex<Vec<u8>>,
}

impl ScriptedScanner {
    fn new(verdict: Verdict) -> Arc<Self> {
        Self::sequence(vec![verdict])
    }

    fn sequence(verdicts: Vec<Verdict>) -> Arc<Self> {
        Arc::new(Self {
            verdicts,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContentScanner for ScriptedScanner {
    fn scan(&self, fd: BorrowedFd<'_>, path: &Path) -> Result<ScanResponse, ScanError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let verdict = self.verdicts[call.min(self.verdicts.len() - 1)];
        let mut file = fs::File::from(fd.try_clone_to_owned().unwrap());
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        *self.seen.lock() = content;

        match verdict {
            Verdict::Clean => Ok(ScanResponse::default()),
            Verdict::Detected(name) => Ok(ScanResponse {
                detections: vec![Detection {
                    path: path.to_path_buf(),
                    threat_type: "virus".to_string(),
                    name: name.to_string(),
                    sha256: "f00d".to_string(),
                }],
                errors: Vec::new(),
            }),
            Verdict::Error => Ok(ScanResponse {
                detections: Vec::new(),
                errors: vec!["engine timeout".to_string()],
            }),
            Verdict::Unavailable => Err(ScanError::Unavailable("socket closed".to_string())),
        }
    }
}

struct Scenario {
    fx: Fixture<MemoryObjectStore>,
    path: PathBuf,
}

fn quarantined_scenario() -> Scenario {
    let fx = memory_fixture();
    assert!(fx.manager.initialise());
    let (path, file) = fx.scanned_file("file", EICAR);
    assert_eq!(
        fx.manager.quarantine(&request(&path), file.as_fd()),
        QuarantineResult::Success
    );
    Scenario { fx, path }
}

fn pipeline<S>(
    fx: &Fixture<S>,
    metadata: &Arc<ScriptedMetadata>,
    scanner: &Arc<ScriptedScanner>,
) -> RescanPipeline {
    RescanPipeline::new(
        Arc::clone(&fx.manager),
        metadata.clone() as Arc<dyn MetadataRescanner>,
        scanner.clone() as Arc<dyn ContentScanner>,
    )
}

#[test]
fn test_metadata_threat_present_skips_full_scan() {
    let Scenario { fx, path } = quarantined_scenario();
    let metadata = ScriptedMetadata::new(MetadataRescanResponse::ThreatPresent);
    let scanner = ScriptedScanner::new(Verdict::Clean);

    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.metadata_confirmed, 1);
    assert_eq!(summary.full_scans, 0);
    assert_eq!(scanner.calls(), 0);
    assert_eq!(fx.store.object_count(), 1);

    let requests = metadata.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].file_path, path);
    assert_eq!(requests[0].sha256, "SHA256abcdef");
    assert_eq!(requests[0].threat.name, "EICAR-AV-Test");
}

#[test]
fn test_every_other_metadata_response_triggers_one_full_scan() {
    for response in [
        MetadataRescanResponse::Undetected,
        MetadataRescanResponse::Clean,
        MetadataRescanResponse::NeedsFullScan,
        MetadataRescanResponse::Failed,
    ] {
        let Scenario { fx, .. } = quarantined_scenario();
        let metadata = ScriptedMetadata::new(response);
        let scanner = ScriptedScanner::new(Verdict::Detected("EICAR-AV-Test"));

        let summary = pipeline(&fx, &metadata, &scanner).rescan_database();
        assert_eq!(scanner.calls(), 1, "{response:?}");
        assert_eq!(summary.full_scans, 1);
        assert_eq!(summary.still_threats, 1);
    }
}

#[test]
fn test_clean_full_scan_restores_file() {
    let Scenario { fx, path } = quarantined_scenario();
    let metadata = ScriptedMetadata::new(MetadataRescanResponse::NeedsFullScan);
    let scanner = ScriptedScanner::new(Verdict::Clean);

    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();
    assert_eq!(summary.restored.len(), 1);
    assert!(summary.restored[0].was_successful);
    assert_eq!(summary.restored[0].path, path);
    assert_eq!(summary.restored[0].correlation_id.to_string(), CORRELATION_ID);

    assert_eq!(*scanner.seen.lock(), EICAR);
    assert_eq!(fs::read(&path).unwrap(), EICAR);
    assert_eq!(fx.store.object_count(), 0);
    assert!(!fx.config().staging_dir.exists());
}

#[test]
fn test_new_detections_replace_threats() {
    let Scenario { fx, .. } = quarantined_scenario();
    let metadata = ScriptedMetadata::new(MetadataRescanResponse::Clean);
    let scanner = ScriptedScanner::new(Verdict::Detected("Troj/Renamed-A"));

    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();
    assert_eq!(summary.still_threats, 1);
    assert!(summary.restored.is_empty());

    let handle = fx.manager.quarantined_handles().remove(0);
    let threats = threats_from_json(
        &fx.store
            .get_custom_data_string(&handle, THREATS_KEY)
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(threats.len(), 1);
    assert_eq!(threats[0].name, "Troj/Renamed-A");
    assert_eq!(threats[0].sha256, "f00d");
}

#[test]
fn test_scanner_errors_keep_object_quarantined() {
    for verdict in [Verdict::Error, Verdict::Unavailable] {
        let Scenario { fx, path } = quarantined_scenario();
        let metadata = ScriptedMetadata::new(MetadataRescanResponse::NeedsFullScan);
        let scanner = ScriptedScanner::new(verdict);

        let summary = pipeline(&fx, &metadata, &scanner).rescan_database();
        assert_eq!(summary.failures, 1);
        assert!(summary.restored.is_empty());
        assert_eq!(fx.store.object_count(), 1);
        assert!(!path.exists());
        assert!(!fx.config().staging_dir.exists());
    }
}

#[test]
fn test_missing_metadata_goes_straight_to_full_scan() {
    let Scenario { fx, .. } = quarantined_scenario();
    let handle = fx.manager.quarantined_handles().remove(0);
    fx.store
        .set_custom_data_string(&handle, SHA256_KEY, "")
        .unwrap();

    let metadata = ScriptedMetadata::new(MetadataRescanResponse::ThreatPresent);
    let scanner = ScriptedScanner::new(Verdict::Detected("EICAR-AV-Test"));
    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();

    assert!(metadata.requests.lock().is_empty());
    assert_eq!(scanner.calls(), 1);
    assert_eq!(summary.still_threats, 1);
}

#[test]
fn test_threat_without_sha256_skips_metadata() {
    let Scenario { fx, .. } = quarantined_scenario();
    let handle = fx.manager.quarantined_handles().remove(0);
    fx.store
        .set_custom_data_string(
            &handle,
            THREATS_KEY,
            r#"[{"type":"virus","name":"EICAR-AV-Test"}]"#,
        )
        .unwrap();

    let metadata = ScriptedMetadata::new(MetadataRescanResponse::ThreatPresent);
    let scanner = ScriptedScanner::new(Verdict::Detected("EICAR-AV-Test"));
    pipeline(&fx, &metadata, &scanner).rescan_database();

    assert!(metadata.requests.lock().is_empty());
    assert_eq!(scanner.calls(), 1);
}

#[test]
fn test_one_failure_does_not_stop_the_sweep() {
    let fx = memory_fixture();
    assert!(fx.manager.initialise());
    let mut paths = Vec::new();
    for (name, threat) in [
        ("a", "00000000-0000-0000-0000-00000000000a"),
        ("b", "00000000-0000-0000-0000-00000000000b"),
    ] {
        let (path, file) = fx.scanned_file(name, EICAR);
        let mut req = request(&path);
        req.threat_id = threat.to_string();
        assert_eq!(
            fx.manager.quarantine(&req, file.as_fd()),
            QuarantineResult::Success
        );
        paths.push(path);
    }

    let metadata = ScriptedMetadata::new(MetadataRescanResponse::NeedsFullScan);
    let scanner = ScriptedScanner::sequence(vec![Verdict::Unavailable, Verdict::Clean]);
    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();

    assert_eq!(summary.examined, 2);
    assert_eq!(scanner.calls(), 2);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.restored.len(), 1);
    assert!(summary.restored[0].was_successful);
    assert_eq!(fx.store.object_count(), 1);
    assert_eq!(paths.iter().filter(|path| path.exists()).count(), 1);
}

#[test]
fn test_extraction_failure_skips_scanner() {
    let Scenario { fx, .. } = quarantined_scenario();
    fx.store.faults().fail_restore = true;

    let metadata = ScriptedMetadata::new(MetadataRescanResponse::NeedsFullScan);
    let scanner = ScriptedScanner::new(Verdict::Clean);
    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();

    assert_eq!(summary.failures, 1);
    assert_eq!(scanner.calls(), 0);
    assert_eq!(fx.store.object_count(), 1);
}

#[test]
fn test_ambiguous_extraction_is_never_scanned() {
    let tamper: [fn(&Path); 3] = [
        |dir| fs::write(dir.join("stowaway"), b"x").unwrap(),
        |dir| fs::remove_file(dir.join("file")).unwrap(),
        |dir| {
            fs::remove_file(dir.join("file")).unwrap();
            fs::create_dir(dir.join("file")).unwrap();
        },
    ];

    for hook in tamper {
        let fx = fixture_with(HookedStore::new());
        assert!(fx.manager.initialise());
        let (path, file) = fx.scanned_file("file", EICAR);
        assert_eq!(
            fx.manager.quarantine(&request(&path), file.as_fd()),
            QuarantineResult::Success
        );
        fx.store.after_extract(hook);

        let metadata = ScriptedMetadata::new(MetadataRescanResponse::NeedsFullScan);
        let scanner = ScriptedScanner::new(Verdict::Clean);
        let summary = pipeline(&fx, &metadata, &scanner).rescan_database();

        assert_eq!(scanner.calls(), 0);
        assert_eq!(summary.failures, 1);
        assert!(summary.restored.is_empty());
        assert_eq!(fx.store.inner.object_count(), 1);
        assert!(!path.exists());
        assert!(!fx.config().staging_dir.exists());
    }
}

#[test]
fn test_failed_restore_after_clean_scan_is_a_failure() {
    let Scenario { fx, path } = quarantined_scenario();
    fs::write(&path, b"occupied").unwrap();

    let metadata = ScriptedMetadata::new(MetadataRescanResponse::NeedsFullScan);
    let scanner = ScriptedScanner::new(Verdict::Clean);
    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();

    assert_eq!(scanner.calls(), 1);
    assert!(summary.restored.is_empty());
    assert_eq!(summary.failures, 1);
    assert_eq!(fs::read(&path).unwrap(), b"occupied");
    assert_eq!(fx.store.object_count(), 1);
}

#[test]
fn test_rescan_skipped_when_not_initialised() {
    let fx = memory_fixture();
    let metadata = ScriptedMetadata::new(MetadataRescanResponse::ThreatPresent);
    let scanner = ScriptedScanner::new(Verdict::Clean);
    let summary = pipeline(&fx, &metadata, &scanner).rescan_database();
    assert_eq!(summary.examined, 0);
}
