//! Dormant flag: a marker file telling the rest of the agent that quarantine
//! is unavailable, and why.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DormantReason {
    Uninitialised,
    Corrupt,
}

impl DormantReason {
    pub fn message(&self) -> &'static str {
        match self {
            DormantReason::Uninitialised => "SafeStore database uninitialised",
            DormantReason::Corrupt => "SafeStore database corrupt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DormantFlag {
    path: PathBuf,
}

impl DormantFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the flag. Failures are logged only.
    pub fn raise(&self, reason: DormantReason) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), "Unable to create dormant flag directory: {}", err);
                return;
            }
        }
        match fs::write(&self.path, reason.message()) {
            Ok(()) => debug!(reason = reason.message(), "Raised dormant flag"),
            Err(err) => warn!(path = %self.path.display(), "Unable to write dormant flag: {}", err),
        }
    }

    /// Remove the flag if present. Failures are logged only.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Cleared dormant flag"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), "Unable to remove dormant flag: {}", err),
        }
    }

    /// Reason text of a raised flag, `None` when the flag is absent.
    pub fn current(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_raise_and_clear() {
        let dir = TempDir::new().unwrap();
        let flag = DormantFlag::new(dir.path().join("flags").join("dormant"));
        assert_eq!(flag.current(), None);

        flag.raise(DormantReason::Uninitialised);
        assert_eq!(
            flag.current().as_deref(),
            Some("SafeStore database uninitialised")
        );

        flag.raise(DormantReason::Corrupt);
        assert_eq!(flag.current().as_deref(), Some("SafeStore database corrupt"));

        flag.clear();
        assert_eq!(flag.current(), None);
        flag.clear();
    }
}
