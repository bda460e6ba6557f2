use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::{
    body::BodyStore,
    error::{QueueError, Result},
    job::DEFAULT_PROTOCOL,
    store::RelayQueue,
};

fn default_path() -> PathBuf {
    PathBuf::from("/var/spool/ferry/relay-queue.bin")
}

fn default_storage() -> PathBuf {
    PathBuf::from("/var/spool/ferry")
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

const SYSTEM_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// Reject paths that are relative, traverse upwards, or point into system
/// directories.
pub fn validate_path(path: &Path) -> Result<()> {
    let invalid = |reason| QueueError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    };

    if path.components().any(|c| c == Component::ParentDir) {
        return Err(invalid("path cannot contain '..' components"));
    }

    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }

    if SYSTEM_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return Err(invalid("path cannot be in a system directory"));
    }

    Ok(())
}

/// Where the queue keeps its state and message bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// The queue state file.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Storage root; bodies are kept in its `queue` subdirectory.
    #[serde(default = "default_storage")]
    pub storage: PathBuf,

    /// Protocol assigned to jobs that do not name one.
    #[serde(default = "default_protocol")]
    pub default_protocol: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            storage: default_storage(),
            default_protocol: default_protocol(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn body_dir(&self) -> PathBuf {
        self.storage.join("queue")
    }

    /// Open the store and the body directory this configuration describes.
    ///
    /// # Errors
    /// Any error from [`RelayQueue::open`] or [`BodyStore::open`], or an
    /// invalid state path.
    pub fn open(&self) -> Result<(RelayQueue, BodyStore)> {
        validate_path(&self.path)?;
        let bodies = BodyStore::open(self.body_dir())?;
        let queue = RelayQueue::open(&self.path)?;
        Ok((queue, bodies))
    }
}
