//! Content-addressed storage for message bodies.
//!
//! Bodies live at `<dir>/<sha256>.eml`, so identical content is stored once
//! and re-persisting is idempotent. Deleting a body is only safe once no
//! queued job refers to it; [`BodyStore::admit`] and [`BodyStore::release`]
//! coordinate through a gate so a freshly written body cannot be collected
//! before its job becomes visible in the queue.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use ferry_common::internal;
use ferry_tracing::traced;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};

use crate::{
    config::validate_path,
    error::{QueueError, Result},
    job::{Envelope, MessageBody, RelayJob},
    store::RelayQueue,
};

const BODY_EXTENSION: &str = "eml";
const STAGING_PREFIX: &str = ".tmp_";

#[derive(Debug)]
pub struct BodyStore {
    dir: PathBuf,
    /// Shared by admissions, exclusive for collection.
    gate: RwLock<()>,
}

impl BodyStore {
    /// Bind to `dir`, creating it if needed and discarding staging files
    /// left by an interrupted write.
    ///
    /// # Errors
    /// [`QueueError::InvalidPath`] for relative, traversing, or system paths;
    /// I/O errors if the directory cannot be prepared.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        validate_path(&dir)?;

        if !dir.try_exists()? {
            internal!("{} does not exist, creating...", dir.display());
            std::fs::create_dir_all(&dir)?;
        } else if !dir.is_dir() {
            return Err(QueueError::InvalidPath {
                path: dir,
                reason: "body store must be a directory",
            });
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} interrupted body write(s) in {}",
                dir.display()
            );
        }

        Ok(Self {
            dir,
            gate: RwLock::new(()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where content with this digest lives.
    #[must_use]
    pub fn path_for(&self, content: &[u8]) -> PathBuf {
        let digest = hex::encode(Sha256::digest(content));
        self.dir.join(format!("{digest}.{BODY_EXTENSION}"))
    }

    fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
            && path.extension().is_some_and(|ext| ext == BODY_EXTENSION)
    }

    /// Store every body in `payload` and return it with path references.
    ///
    /// Inline bodies are written out; stored bodies outside this directory
    /// are moved in under their content address. A missing body file is an
    /// error, and nothing is queued by this call.
    pub async fn persist(&self, payload: Vec<Envelope>) -> Result<Vec<Envelope>> {
        self.persist_tracked(payload, &mut Vec::new()).await
    }

    /// [`persist`](Self::persist), noting each stored path in `written` as
    /// it lands so a caller can collect them if a later envelope fails.
    async fn persist_tracked(
        &self,
        payload: Vec<Envelope>,
        written: &mut Vec<PathBuf>,
    ) -> Result<Vec<Envelope>> {
        let mut stored = Vec::with_capacity(payload.len());

        for mut envelope in payload {
            let path = match envelope.body {
                MessageBody::Inline(content) => self.write(&content).await?,
                MessageBody::Stored(path) => self.adopt(path).await?,
            };
            written.push(path.clone());
            envelope.body = MessageBody::Stored(path);
            stored.push(envelope);
        }

        Ok(stored)
    }

    /// Persist `job`'s bodies and queue it, holding the gate throughout so a
    /// concurrent [`release`](Self::release) cannot collect the new bodies.
    /// Returns the queue size and the job as queued.
    ///
    /// If storing a body or queueing fails, the bodies already stored for
    /// this job are released again, adopted files included.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(id = %job.id)), timing(precision = "ms"))]
    pub async fn admit(&self, queue: &RelayQueue, mut job: RelayJob) -> Result<(usize, RelayJob)> {
        job.validate()?;

        let mut written = Vec::new();
        let admitted = {
            let _admission = self.gate.read().await;
            match self.persist_tracked(job.payload, &mut written).await {
                Ok(payload) => {
                    job.payload = payload;
                    queue.enqueue(job.clone()).await.map(|size| (size, job))
                }
                Err(err) => Err(err),
            }
        };

        if let Err(err) = &admitted {
            internal!(
                level = DEBUG,
                "Admission failed ({err}), releasing {} stored bod(ies)",
                written.len()
            );
            self.release(queue, &written).await;
        }

        admitted
    }

    /// Delete candidate bodies that no queued job references any more.
    ///
    /// Paths outside this directory are never touched. Deletion failures
    /// are logged and otherwise ignored; the file is simply left behind.
    pub async fn release<I, P>(&self, queue: &RelayQueue, candidates: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let candidates: Vec<PathBuf> = candidates
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .filter(|p| self.owns(p))
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let _collection = self.gate.write().await;
        let referenced: HashSet<PathBuf> = queue
            .snapshot()
            .iter()
            .flat_map(RelayJob::body_paths)
            .map(Path::to_path_buf)
            .collect();

        let mut released = 0;
        for path in candidates
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|p| !referenced.contains(p))
        {
            match fs::remove_file(&path).await {
                Ok(()) => released += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => internal!(
                    level = WARN,
                    "Failed to delete body {}: {err}",
                    path.display()
                ),
            }
        }

        if released > 0 {
            internal!(level = DEBUG, "Released {released} message bod(ies)");
        }
        released
    }

    async fn write(&self, content: &[u8]) -> Result<PathBuf> {
        let target = self.path_for(content);
        if fs::try_exists(&target).await? {
            return Ok(target);
        }

        let staging = self
            .dir
            .join(format!("{STAGING_PREFIX}{}", ulid::Ulid::new()));
        let mut file = fs::File::create(&staging).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &target).await?;
        fs::File::open(&self.dir).await?.sync_all().await?;

        internal!(level = DEBUG, "Stored body {}", target.display());
        Ok(target)
    }

    /// Bring an existing file under content addressing.
    async fn adopt(&self, source: PathBuf) -> Result<PathBuf> {
        let content = match fs::read(&source).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::MissingBody(source));
            }
            Err(err) => return Err(err.into()),
        };

        let target = self.path_for(&content);
        if source == target {
            return Ok(target);
        }

        if fs::try_exists(&target).await? {
            fs::remove_file(&source).await?;
            return Ok(target);
        }

        if let Err(err) = fs::rename(&source, &target).await {
            // Typically a cross-device move: copy, then drop the original.
            internal!(
                level = DEBUG,
                "Rename of {} failed ({err}), copying instead",
                source.display()
            );
            self.write(&content).await?;
            fs::remove_file(&source).await?;
        } else {
            fs::File::open(&self.dir).await?.sync_all().await?;
        }

        Ok(target)
    }
}
