//! The durable relay queue.
//!
//! The whole queue is one bincode document at the store's location, replaced
//! atomically (`<location>.tmp`, fsync, rename, fsync directory) on every
//! mutation. Readers see an immutable published `Arc<Vec<RelayJob>>` and never
//! wait on disk; writers queue on a single async mutex around
//! read, modify, persist, publish. A failed persist publishes nothing.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use ferry_common::internal;
use ferry_tracing::traced;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use crate::{
    error::{QueueError, Result},
    job::{JobId, RelayJob, retry_histogram},
    lock::{LocationLock, sibling},
};

/// Bumped whenever the persisted layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct StateRef<'a> {
    version: u32,
    jobs: &'a [RelayJob],
}

#[derive(Deserialize)]
struct State {
    version: u32,
    jobs: Vec<RelayJob>,
}

fn encode(jobs: &[RelayJob]) -> Result<Vec<u8>> {
    let state = StateRef {
        version: STATE_VERSION,
        jobs,
    };
    Ok(bincode::serde::encode_to_vec(
        &state,
        bincode::config::standard(),
    )?)
}

fn decode(bytes: &[u8]) -> Result<Vec<RelayJob>> {
    let (state, _): (State, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;

    if state.version != STATE_VERSION {
        return Err(QueueError::UnsupportedVersion {
            found: state.version,
            expected: STATE_VERSION,
        });
    }

    Ok(state.jobs)
}

/// What a mutation did to the working copy.
enum Change<T> {
    /// Persist and publish the working copy, then return `T`.
    Commit(T),
    /// Nothing changed; skip the write and return `T`.
    Skip(T),
}

/// Insertion-ordered, durable collection of relay jobs keyed by id.
///
/// Construct it once per location with [`RelayQueue::open`] and share it as
/// `Arc<RelayQueue>`. Dropping the last handle releases the location.
#[derive(Debug)]
pub struct RelayQueue {
    path: PathBuf,
    published: RwLock<Arc<Vec<RelayJob>>>,
    writer: Mutex<()>,
    _lock: LocationLock,
}

impl RelayQueue {
    /// Bind a store to `path`, loading whatever was durable there.
    ///
    /// Creates the parent directory if needed and removes a staging file
    /// left behind by a crash mid-write.
    ///
    /// # Errors
    /// [`QueueError::AlreadyOpen`] or [`QueueError::Locked`] if the location
    /// is in use; I/O or decode errors if existing state cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let lock = LocationLock::acquire(path)?;
        let path = lock.location().to_path_buf();

        let staging = sibling(&path, ".tmp");
        if staging.try_exists()? {
            internal!(
                level = WARN,
                "Removing stale staging file {}",
                staging.display()
            );
            std::fs::remove_file(&staging)?;
        }

        let jobs = match std::fs::read(&path) {
            Ok(bytes) => decode(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        internal!(
            level = INFO,
            "Opened relay queue at {} with {} job(s)",
            path.display(),
            jobs.len()
        );

        Ok(Self {
            path,
            published: RwLock::new(Arc::new(jobs)),
            writer: Mutex::new(()),
            _lock: lock,
        })
    }

    /// Canonical location of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point-in-time copy of every job, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RelayJob> {
        Vec::clone(&self.published.read())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.published.read().is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<RelayJob> {
        self.published.read().iter().find(|job| job.id == *id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &JobId) -> bool {
        self.published.read().iter().any(|job| job.id == *id)
    }

    #[must_use]
    pub fn retry_histogram(&self) -> BTreeMap<u32, usize> {
        retry_histogram(self.published.read().iter())
    }

    /// Append a job and persist. Returns the new queue size.
    ///
    /// # Errors
    /// [`QueueError::InvalidJob`] for malformed jobs, including ones whose
    /// bodies are still inline; [`QueueError::DuplicateId`] if the id is
    /// taken; storage errors if the write fails.
    pub async fn enqueue(&self, job: RelayJob) -> Result<usize> {
        job.validate_for_queue()?;
        let id = job.id;

        let size = self
            .commit(move |jobs| {
                if jobs.iter().any(|existing| existing.id == job.id) {
                    return Err(QueueError::DuplicateId(job.id));
                }
                jobs.push(job);
                Ok(Change::Commit(jobs.len()))
            })
            .await?;

        internal!(level = DEBUG, "Queued job {id}, queue size {size}");
        Ok(size)
    }

    /// Remove one job. `false` if it was not queued.
    pub async fn remove_by_id(&self, id: &JobId) -> Result<bool> {
        Ok(self.remove_by_ids(std::slice::from_ref(id)).await?.len() == 1)
    }

    /// Remove every listed job with a single write. Returns the removed jobs;
    /// ids that are not queued are ignored.
    pub async fn remove_by_ids(&self, ids: &[JobId]) -> Result<Vec<RelayJob>> {
        let wanted: HashSet<&JobId> = ids.iter().collect();

        self.commit(|jobs| {
            let (removed, kept): (Vec<RelayJob>, Vec<RelayJob>) = std::mem::take(jobs)
                .into_iter()
                .partition(|job| wanted.contains(&job.id));
            *jobs = kept;

            Ok(if removed.is_empty() {
                Change::Skip(removed)
            } else {
                Change::Commit(removed)
            })
        })
        .await
    }

    /// Swap in `updated` for the job with `id`, keeping its position.
    ///
    /// A no-op returning `false` when `id` is no longer queued, so a job
    /// deleted while its delivery was in flight is never resurrected.
    pub async fn replace(&self, id: &JobId, mut updated: RelayJob) -> Result<bool> {
        updated.id = *id;
        updated.validate_for_queue()?;

        self.commit(move |jobs| {
            Ok(match jobs.iter_mut().find(|job| job.id == updated.id) {
                Some(slot) => {
                    *slot = updated;
                    Change::Commit(true)
                }
                None => Change::Skip(false),
            })
        })
        .await
    }

    /// Read-modify-write of one job under the writer lock, so the change is
    /// computed from the current record rather than a stale snapshot.
    /// Returns the updated job, or `None` if `id` is not queued.
    pub async fn update<F>(&self, id: &JobId, apply: F) -> Result<Option<RelayJob>>
    where
        F: FnOnce(&mut RelayJob) + Send,
    {
        self.commit(move |jobs| {
            Ok(match jobs.iter_mut().find(|job| job.id == *id) {
                Some(job) => {
                    apply(job);
                    job.id = *id;
                    Change::Commit(Some(job.clone()))
                }
                None => Change::Skip(None),
            })
        })
        .await
    }

    async fn commit<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<RelayJob>) -> Result<Change<T>>,
    {
        let _writer = self.writer.lock().await;

        let current = Arc::clone(&self.published.read());
        let mut working = Vec::clone(&current);

        match apply(&mut working)? {
            Change::Skip(value) => Ok(value),
            Change::Commit(value) => {
                self.persist(&working).await?;
                *self.published.write() = Arc::new(working);
                Ok(value)
            }
        }
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(jobs = jobs.len())), timing(precision = "ms"))]
    async fn persist(&self, jobs: &[RelayJob]) -> Result<()> {
        let bytes = encode(jobs)?;
        let staging = sibling(&self.path, ".tmp");

        let mut file = fs::File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &self.path).await?;

        if let Some(dir) = self.path.parent() {
            fs::File::open(dir).await?.sync_all().await?;
        }

        Ok(())
    }
}
