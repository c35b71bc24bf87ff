//! Filesystem side of saving and restoring objects.

use crate::{StoreError, StoreResult};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// A regular file read from disk together with the attributes restored later.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub content: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Reject names that would escape `directory` and non-absolute directories.
pub fn validate_target(directory: &Path, filename: &OsStr) -> StoreResult<()> {
    if !directory.is_absolute() {
        return Err(StoreError::InvalidArgument(format!(
            "directory must be absolute: {}",
            directory.display()
        )));
    }
    let bytes = filename.as_bytes();
    if bytes.is_empty()
        || bytes == b"."
        || bytes == b".."
        || bytes.contains(&b'/')
        || bytes.contains(&0)
    {
        return Err(StoreError::InvalidArgument(format!(
            "invalid file name: {filename:?}"
        )));
    }
    Ok(())
}

/// Read `directory/filename`, refusing symlinks and anything not a regular file.
pub fn read_source(directory: &Path, filename: &OsStr) -> io::Result<SourceFile> {
    let path = directory.join(filename);
    let metadata = fs::symlink_metadata(&path)?;
    if !metadata.file_type().is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ));
    }
    let content = fs::read(&path)?;
    Ok(SourceFile {
        content,
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
    })
}

/// Create `directory/filename` with the original content, mode and owner.
///
/// Never overwrites an existing entry. Ownership is reapplied best-effort:
/// an unprivileged process can only hand files to itself.
pub fn write_restored(
    directory: &Path,
    filename: &OsStr,
    content: &[u8],
    mode: u32,
    uid: u32,
    gid: u32,
) -> StoreResult<PathBuf> {
    validate_target(directory, filename)?;
    fs::create_dir_all(directory)?;

    let target = directory.join(filename);
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode & 0o7777)
        .open(&target)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(StoreError::TargetExists(target));
        }
        Err(err) => return Err(err.into()),
    };

    let written = file.write_all(content).and_then(|_| file.sync_all());
    if let Err(err) = written {
        drop(file);
        let _ = fs::remove_file(&target);
        return Err(err.into());
    }

    // chown clears setuid and setgid, so ownership goes first.
    if let Err(err) = std::os::unix::fs::chown(&target, Some(uid), Some(gid)) {
        warn!(
            path = %target.display(),
            uid,
            gid,
            "Unable to restore original ownership: {}",
            err
        );
    }

    // The create mode is filtered through the umask.
    fs::set_permissions(&target, Permissions::from_mode(mode & 0o7777))?;

    Ok(target)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
