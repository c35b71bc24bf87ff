use crate::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of putting a quarantined file back on disk, reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub path: PathBuf,
    pub correlation_id: CorrelationId,
    pub was_successful: bool,
}
