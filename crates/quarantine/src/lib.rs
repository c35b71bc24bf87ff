//! SafeStore quarantine engine.
//!
//! [`QuarantineManager`] takes custody of detected files, restores them and
//! tracks the health of the object store. [`StateMonitor`] keeps it
//! initialised from a background thread, and [`RescanPipeline`] periodically
//! re-evaluates everything held in quarantine.

pub mod config;
pub mod dormant;
pub mod file_identity;
pub mod manager;
pub mod monitor;
pub mod rescan;
pub mod state;

pub use config::{ConfigError, QuarantineConfig};
pub use dormant::{DormantFlag, DormantReason};
pub use file_identity::{DirHandle, FileFingerprint, IdentityCheck};
pub use manager::{
    QuarantineManager, QuarantineRequest, QuarantinedObjectSummary, CORRELATION_ID_KEY,
    SHA256_KEY, THREATS_KEY,
};
pub use monitor::{Backoff, StateMonitor};
pub use rescan::{
    ContentScanner, MetadataRescanRequest, MetadataRescanResponse, MetadataRescanner,
    RescanPipeline, RescanSummary, ScanError, ScanResponse,
};
pub use state::{HealthTracker, QuarantineHealth, QuarantineManagerState};
