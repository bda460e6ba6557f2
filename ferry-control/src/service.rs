use std::{fmt, sync::Arc};

use ferry_common::{operator, time};
use ferry_delivery::{BounceHandler, DiscardBounces, WorkerHandle};
use ferry_queue::{BodyStore, RelayJob, RelayQueue};

use crate::{
    config::ControlConfig,
    error::Result,
    protocol::{
        BounceResponse, DeleteResponse, EnqueueRequest, EnqueueResponse, EnvelopeRequest, JobSummary,
        ListQuery, ListResponse, RetryResponse, StatsResponse, Status, TargetIds,
    },
};

/// Operator-facing operations on the relay queue.
///
/// Safe to call from any number of tasks while the retry worker runs: every
/// mutation goes through the queue's single writer.
pub struct QueueService {
    config: ControlConfig,
    default_protocol: String,
    queue: Arc<RelayQueue>,
    bodies: Arc<BodyStore>,
    bounces: Arc<dyn BounceHandler>,
    worker: WorkerHandle,
}

impl fmt::Debug for QueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueService")
            .field("config", &self.config)
            .field("default_protocol", &self.default_protocol)
            .field("queue", &self.queue.path())
            .finish_non_exhaustive()
    }
}

impl QueueService {
    #[must_use]
    pub fn new(
        config: ControlConfig,
        default_protocol: impl Into<String>,
        queue: Arc<RelayQueue>,
        bodies: Arc<BodyStore>,
        worker: WorkerHandle,
    ) -> Self {
        Self {
            config,
            default_protocol: default_protocol.into(),
            queue,
            bodies,
            bounces: Arc::new(DiscardBounces),
            worker,
        }
    }

    #[must_use]
    pub fn with_bounces(mut self, bounces: Arc<dyn BounceHandler>) -> Self {
        self.bounces = bounces;
        self
    }

    /// Validate and queue a new job with no attempts.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResponse> {
        let payload = request
            .envelopes
            .into_iter()
            .map(EnvelopeRequest::into_envelope)
            .collect::<Result<Vec<_>>>()?;

        let protocol = request
            .protocol
            .unwrap_or_else(|| self.default_protocol.clone());
        let mut job = RelayJob::new(payload, protocol, time::epoch_seconds());
        if let Some(mailbox) = request.mailbox {
            job = job.with_mailbox(mailbox);
        }

        let (queue_size, job) = self.bodies.admit(&self.queue, job).await?;
        operator!(
            "Queued job {} via {} with {} envelope(s); queue size {queue_size}",
            job.id,
            job.protocol,
            job.payload.len()
        );

        Ok(EnqueueResponse {
            status: Status::Queued,
            queue_size,
            session: JobSummary::from(&job),
        })
    }

    #[must_use]
    pub fn list(&self, query: ListQuery) -> ListResponse {
        let jobs = self.queue.snapshot();
        let limit = self.config.page_size(query.limit);
        let page = query.page.unwrap_or(1).max(1);
        let offset = (page - 1).saturating_mul(limit);

        ListResponse {
            total: jobs.len(),
            page,
            limit,
            total_pages: jobs.len().div_ceil(limit),
            items: jobs.iter().skip(offset).take(limit).map(JobSummary::from).collect(),
        }
    }

    pub async fn delete(&self, targets: &TargetIds) -> Result<DeleteResponse> {
        let removed = self.remove(targets).await?;
        if !removed.is_empty() {
            operator!("Deleted {} job(s)", removed.len());
        }
        self.release(&removed).await;

        Ok(DeleteResponse {
            status: Status::Ok,
            deleted_count: removed.len(),
            queue_size: self.queue.len(),
        })
    }

    /// Count an attempt against each job and make it eligible straight
    /// away, then wake the worker.
    pub async fn retry(&self, targets: &TargetIds) -> Result<RetryResponse> {
        let ids = targets.resolve()?;
        let now = time::epoch_seconds();

        let mut retried = 0;
        for id in ids {
            if let Some(job) = self
                .queue
                .update(&id, move |job| job.force_retry(now))
                .await?
            {
                operator!("Retrying job {id}, attempt {}", job.attempt_count);
                retried += 1;
            }
        }

        if retried > 0 {
            self.worker.process_now();
        }

        Ok(RetryResponse {
            status: Status::Ok,
            retried_count: retried,
            queue_size: self.queue.len(),
        })
    }

    /// Remove jobs and hand each to the bounce handler. Handler failures are
    /// logged; the jobs stay removed.
    pub async fn bounce(&self, targets: &TargetIds) -> Result<BounceResponse> {
        let removed = self.remove(targets).await?;

        for job in &removed {
            operator!("Bouncing job {}", job.id);
            if let Err(err) = self.bounces.bounce(job).await {
                operator!(level = WARN, "Bounce of job {} failed: {err}", job.id);
            }
        }
        self.release(&removed).await;

        Ok(BounceResponse {
            status: Status::Ok,
            bounced_count: removed.len(),
            queue_size: self.queue.len(),
        })
    }

    #[must_use]
    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            queue_size: self.queue.len(),
            retry_histogram: self.queue.retry_histogram(),
            scheduler: self.worker.status(),
        }
    }

    async fn remove(&self, targets: &TargetIds) -> Result<Vec<RelayJob>> {
        let ids = targets.resolve()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self.queue.remove_by_ids(&ids).await?)
    }

    async fn release(&self, removed: &[RelayJob]) {
        self.bodies
            .release(&self.queue, removed.iter().flat_map(RelayJob::body_paths))
            .await;
    }

    /// Parse a JSON request body and run [`enqueue`](Self::enqueue) on it.
    pub async fn enqueue_json(&self, body: &[u8]) -> Result<EnqueueResponse> {
        let request: EnqueueRequest = serde_json::from_slice(body)?;
        self.enqueue(request).await
    }
}
