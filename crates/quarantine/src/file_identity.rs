//! Directory-relative file identity checks.
//!
//! A path is only a name. Between scanning a file and unlinking it the entry
//! can be deleted, renamed or replaced, so every decision here compares the
//! (device, inode) of the scanned descriptor with whatever currently sits at
//! `name` inside a directory descriptor held open for the whole operation.

use rustix::fs::{fstat, openat, statat, unlinkat, AtFlags, Mode, OFlags, CWD};
use rustix::io::Errno;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

const DELETED_MARKER: &str = " (deleted)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileFingerprint {
    pub device: u64,
    pub inode: u64,
}

impl FileFingerprint {
    pub fn of_fd(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let stat = fstat(fd)?;
        Ok(Self {
            device: stat.st_dev as u64,
            inode: stat.st_ino as u64,
        })
    }
}

/// Result of comparing a directory entry with an open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityCheck {
    /// The entry is the descriptor's file.
    Matches,
    /// No entry, and the descriptor's file has been unlinked.
    AlreadyDeleted,
    /// No entry, but the file still exists somewhere else.
    Missing,
    /// Something else occupies the name.
    Mismatch,
}

/// An open directory descriptor plus the path used to open it.
#[derive(Debug)]
pub struct DirHandle {
    fd: OwnedFd,
    path: PathBuf,
}

impl DirHandle {
    pub fn open(path: &Path) -> io::Result<Self> {
        let fd = openat(
            CWD,
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fingerprint of the entry `name`, without following symlinks.
    /// `None` when nothing is there.
    pub fn fingerprint_of(&self, name: impl AsRef<Path>) -> io::Result<Option<FileFingerprint>> {
        match statat(self.fd.as_fd(), name.as_ref(), AtFlags::SYMLINK_NOFOLLOW) {
            Ok(stat) => Ok(Some(FileFingerprint {
                device: stat.st_dev as u64,
                inode: stat.st_ino as u64,
            })),
            Err(err) if err == Errno::NOENT => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn unlink(&self, name: impl AsRef<Path>) -> io::Result<()> {
        unlinkat(self.fd.as_fd(), name.as_ref(), AtFlags::empty())?;
        Ok(())
    }

    /// Compare the entry `name` with the file behind `fd`.
    pub fn verify(&self, name: impl AsRef<Path>, fd: BorrowedFd<'_>) -> io::Result<IdentityCheck> {
        let expected = FileFingerprint::of_fd(fd)?;
        Ok(match self.fingerprint_of(name)? {
            Some(actual) if actual == expected => IdentityCheck::Matches,
            Some(_) => IdentityCheck::Mismatch,
            None if is_unlinked(fd)? => IdentityCheck::AlreadyDeleted,
            None => IdentityCheck::Missing,
        })
    }
}

/// Path the kernel currently reports for `fd`.
pub fn live_path(fd: BorrowedFd<'_>) -> io::Result<PathBuf> {
    fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// Whether the file behind `fd` has no remaining directory entries.
pub fn is_unlinked(fd: BorrowedFd<'_>) -> io::Result<bool> {
    if fstat(fd)?.st_nlink == 0 {
        return Ok(true);
    }
    Ok(live_path(fd)?
        .to_string_lossy()
        .ends_with(DELETED_MARKER))
}
