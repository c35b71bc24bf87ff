use crate::config::DEFAULT_ERROR_THRESHOLD;
use crate::dormant::DormantReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// Health of the quarantine database as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuarantineManagerState {
    Startup,
    Initialised,
    Uninitialised,
    Corrupt,
}

impl QuarantineManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineManagerState::Startup => "STARTUP",
            QuarantineManagerState::Initialised => "INITIALISED",
            QuarantineManagerState::Uninitialised => "UNINITIALISED",
            QuarantineManagerState::Corrupt => "CORRUPT",
        }
    }

    pub fn dormant_reason(&self) -> Option<DormantReason> {
        match self {
            QuarantineManagerState::Initialised => None,
            QuarantineManagerState::Corrupt => Some(DormantReason::Corrupt),
            QuarantineManagerState::Startup | QuarantineManagerState::Uninitialised => {
                Some(DormantReason::Uninitialised)
            }
        }
    }
}

impl fmt::Display for QuarantineManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the manager's health for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantineHealth {
    pub state: QuarantineManagerState,
    pub consecutive_errors: u32,
    pub error_threshold: u32,
    pub dormant_reason: Option<String>,
}

/// State plus the consecutive-error counter.
///
/// Persistent store failures count toward the threshold; reaching it turns
/// the database corrupt. Only a successful open leaves `Corrupt`.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: QuarantineManagerState,
    consecutive_errors: u32,
    threshold: u32,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: QuarantineManagerState::Startup,
            consecutive_errors: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn state(&self) -> QuarantineManagerState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold.max(1);
    }

    /// Store opened, or an operation against it succeeded.
    pub fn record_success(&mut self) {
        self.state = QuarantineManagerState::Initialised;
        self.consecutive_errors = 0;
    }

    /// Open failed for a reason that says nothing about the database itself.
    pub fn record_transient(&mut self) {
        if matches!(
            self.state,
            QuarantineManagerState::Startup | QuarantineManagerState::Uninitialised
        ) {
            self.state = QuarantineManagerState::Uninitialised;
        }
    }

    /// A persistent store failure. Returns the resulting state.
    pub fn record_failure(&mut self) -> QuarantineManagerState {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= self.threshold {
            self.state = QuarantineManagerState::Corrupt;
        } else if self.state == QuarantineManagerState::Startup {
            self.state = QuarantineManagerState::Uninitialised;
        }
        self.state
    }

    /// Back to a clean, not yet opened database.
    pub fn reset(&mut self) {
        self.state = QuarantineManagerState::Uninitialised;
        self.consecutive_errors = 0;
    }

    /// Store closed while it was open.
    pub fn mark_closed(&mut self) {
        if self.state == QuarantineManagerState::Initialised {
            self.state = QuarantineManagerState::Uninitialised;
        }
    }
}

/// Read the persisted error threshold, falling back to the default when the
/// file is missing or does not hold a positive integer.
pub fn load_error_threshold(path: &Path) -> u32 {
    match fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse::<u32>() {
            Ok(value) if value > 0 => value,
            _ => {
                warn!(
                    path = %path.display(),
                    "Ignoring malformed error threshold {:?}, using {}",
                    raw.trim(),
                    DEFAULT_ERROR_THRESHOLD
                );
                DEFAULT_ERROR_THRESHOLD
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => DEFAULT_ERROR_THRESHOLD,
        Err(err) => {
            warn!(path = %path.display(), "Unable to read error threshold: {}", err);
            DEFAULT_ERROR_THRESHOLD
        }
    }
}

pub fn store_error_threshold(path: &Path, threshold: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, threshold.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_threshold_failures_reach_corrupt() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.record_failure(), QuarantineManagerState::Uninitialised);
        assert_eq!(tracker.record_failure(), QuarantineManagerState::Uninitialised);
        assert_eq!(tracker.record_failure(), QuarantineManagerState::Corrupt);
        assert_eq!(tracker.consecutive_errors(), 3);
    }

    #[test]
    fn test_transient_failures_never_count() {
        let mut tracker = HealthTracker::new(1);
        for _ in 0..5 {
            tracker.record_transient();
        }
        assert_eq!(tracker.state(), QuarantineManagerState::Uninitialised);
        assert_eq!(tracker.consecutive_errors(), 0);
    }

    #[test]
    fn test_corrupt_only_left_by_success() {
        let mut tracker = HealthTracker::new(1);
        tracker.record_failure();
        tracker.record_transient();
        assert_eq!(tracker.state(), QuarantineManagerState::Corrupt);

        tracker.record_success();
        assert_eq!(tracker.state(), QuarantineManagerState::Initialised);
        assert_eq!(tracker.consecutive_errors(), 0);
    }

    #[test]
    fn test_failures_while_initialised_keep_serving_below_threshold() {
        let mut tracker = HealthTracker::new(2);
        tracker.record_success();
        assert_eq!(tracker.record_failure(), QuarantineManagerState::Initialised);
        tracker.record_success();
        assert_eq!(tracker.record_failure(), QuarantineManagerState::Initialised);
        assert_eq!(tracker.record_failure(), QuarantineManagerState::Corrupt);
    }

    #[test]
    fn test_persisted_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threshold");
        assert_eq!(load_error_threshold(&path), DEFAULT_ERROR_THRESHOLD);

        store_error_threshold(&path, 4).unwrap();
        assert_eq!(load_error_threshold(&path), 4);

        fs::write(&path, "zero").unwrap();
        assert_eq!(load_error_threshold(&path), DEFAULT_ERROR_THRESHOLD);
        fs::write(&path, "0").unwrap();
        assert_eq!(load_error_threshold(&path), DEFAULT_ERROR_THRESHOLD);
    }
}
