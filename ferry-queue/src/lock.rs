//! One live store per backing location.
//!
//! Inside a process a registry of open locations gives a clear
//! [`QueueError::AlreadyOpen`]; across processes an exclusive `flock` on
//! `<location>.lock` does the same job and disappears with the process.

use std::{
    collections::HashSet,
    fs::File,
    io::Write,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use ferry_common::internal;
use parking_lot::Mutex;

use crate::error::{QueueError, Result};

static OPEN_LOCATIONS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Held for as long as a store is bound to its location.
#[derive(Debug)]
pub(crate) struct LocationLock {
    location: PathBuf,
    _file: File,
}

impl LocationLock {
    /// `location` must have an existing parent directory.
    pub(crate) fn acquire(location: &Path) -> Result<Self> {
        let location = canonical_location(location)?;

        if !OPEN_LOCATIONS.lock().insert(location.clone()) {
            return Err(QueueError::AlreadyOpen(location));
        }

        match lock_file(&location) {
            Ok(file) => Ok(Self {
                location,
                _file: file,
            }),
            Err(err) => {
                OPEN_LOCATIONS.lock().remove(&location);
                Err(err)
            }
        }
    }

    pub(crate) fn location(&self) -> &Path {
        &self.location
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        OPEN_LOCATIONS.lock().remove(&self.location);
        internal!("Released queue location {}", self.location.display());
    }
}

/// The file may not exist yet, so canonicalize the directory instead.
fn canonical_location(location: &Path) -> Result<PathBuf> {
    let file_name = location.file_name().ok_or_else(|| QueueError::InvalidPath {
        path: location.to_path_buf(),
        reason: "queue location must name a file",
    })?;

    let parent = match location.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    Ok(parent.canonicalize()?.join(file_name))
}

pub(crate) fn sibling(location: &Path, suffix: &str) -> PathBuf {
    let mut name = location.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn lock_file(location: &Path) -> Result<File> {
    let path = sibling(location, ".lock");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)?;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::WouldBlock {
            return Err(err.into());
        }

        let owner = std::fs::read_to_string(&path)
            .map(|pid| format!(". Owned by pid {}.", pid.trim()))
            .unwrap_or_default();

        return Err(QueueError::Locked {
            path: location.to_path_buf(),
            owner,
        });
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;

    Ok(file)
}
