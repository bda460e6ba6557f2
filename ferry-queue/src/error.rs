//! Error types for the ferry-queue crate.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::JobId;

/// Every fallible queue and body-store operation returns this.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Reading or writing the state file, lock file, or a body failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted state could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// The persisted state could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The persisted state was written by an incompatible version.
    #[error("Unsupported queue state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// A store for this location is already live in this process.
    #[error("Queue at {} is already open in this process", .0.display())]
    AlreadyOpen(PathBuf),

    /// Another process holds the lock for this location.
    #[error("Queue at {} is locked by another process{owner}", path.display())]
    Locked { path: PathBuf, owner: String },

    /// A job was rejected before anything was written.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A job with this id is already queued.
    #[error("Job already queued: {0}")]
    DuplicateId(JobId),

    /// A body file referenced by a job does not exist.
    #[error("Message body missing: {}", .0.display())]
    MissingBody(PathBuf),

    /// A configured path was rejected.
    #[error("Invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Returns `true` when the failure is about the caller's input rather
    /// than the queue's storage.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidJob(_) | Self::DuplicateId(_) | Self::MissingBody(_)
        )
    }
}
