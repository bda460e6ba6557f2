//! The periodic retry worker.

mod schedule;
mod settle;

use std::{fmt, sync::Arc, time::Duration};

use ferry_common::{Signal, internal, relay, time};
use ferry_queue::{BodyStore, RelayJob, RelayQueue, retry_histogram};
use ferry_tracing::traced;
use serde::Deserialize;
use tokio::{
    sync::{Notify, Semaphore, broadcast},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};

pub use self::schedule::{SchedulerStatus, WorkerHandle};
use self::{
    schedule::Schedule,
    settle::{Settlement, settle},
};
use crate::{
    agent::{DeliveryAgent, DeliveryReport},
    bounce::{BounceHandler, DiscardBounces},
    error::DeliveryError,
    policy::RetryPolicy,
};

const fn default_initial_delay_secs() -> u64 {
    60
}

const fn default_period_secs() -> u64 {
    60
}

const fn default_max_dequeue_per_tick() -> usize {
    100
}

const fn default_max_concurrent_deliveries() -> usize {
    8
}

const fn default_attempt_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Delay before the first tick.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Time between ticks. Zero is treated as one second.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Upper bound on attempts started by a single tick.
    #[serde(default = "default_max_dequeue_per_tick")]
    pub max_dequeue_per_tick: usize,

    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// An attempt still running after this long counts as failed.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            period_secs: default_period_secs(),
            max_dequeue_per_tick: default_max_dequeue_per_tick(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Jobs in the snapshot.
    pub queued: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    /// Exhausted jobs removed and handed to the bounce handler.
    pub expired: usize,
}

pub struct RetryWorker {
    config: WorkerConfig,
    policy: RetryPolicy,
    queue: Arc<RelayQueue>,
    bodies: Arc<BodyStore>,
    agent: Arc<dyn DeliveryAgent>,
    bounces: Arc<dyn BounceHandler>,
    schedule: Arc<Schedule>,
    nudge: Arc<Notify>,
}

impl fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryWorker")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("queue", &self.queue.path())
            .finish_non_exhaustive()
    }
}

impl RetryWorker {
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        policy: RetryPolicy,
        queue: Arc<RelayQueue>,
        bodies: Arc<BodyStore>,
        agent: Arc<dyn DeliveryAgent>,
    ) -> Self {
        Self {
            config,
            policy,
            queue,
            bodies,
            agent,
            bounces: Arc::new(DiscardBounces),
            schedule: Arc::default(),
            nudge: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_bounces(mut self, bounces: Arc<dyn BounceHandler>) -> Self {
        self.bounces = bounces;
        self
    }

    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            policy: self.policy.clone(),
            initial_delay_secs: self.config.initial_delay_secs,
            period_secs: self.period().as_secs(),
            schedule: Arc::clone(&self.schedule),
            nudge: Arc::clone(&self.nudge),
        }
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.config.period_secs.max(1))
    }

    /// Run ticks on the configured schedule, and whenever a
    /// [`WorkerHandle::process_now`] nudge arrives, until shutdown.
    ///
    /// A tick that has started always runs to completion; the shutdown
    /// signal is only observed between ticks.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            "Retry worker starting: first tick in {}s, then every {}s",
            self.config.initial_delay_secs,
            self.period().as_secs()
        );

        let start = Instant::now() + Duration::from_secs(self.config.initial_delay_secs);
        let mut timer = tokio::time::interval_at(start, self.period());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.schedule
            .set_next(time::epoch_seconds().saturating_add(self.config.initial_delay_secs));

        loop {
            tokio::select! {
                biased;

                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Retry worker received shutdown signal");
                        }
                        Err(err) => {
                            internal!(level = ERROR, "Retry worker shutdown channel error: {err}");
                        }
                    }
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
                () = self.nudge.notified() => {
                    relay!(level = DEBUG, "Retry worker nudged");
                    self.tick().await;
                    // The next scheduled tick is a full period after this one.
                    timer.reset();
                }
            }
        }

        internal!(level = INFO, "Retry worker stopped");
    }

    /// One pass over the queue: expire exhausted jobs, then attempt every
    /// eligible one within the tick budget and write back the outcomes.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn tick(&self) -> TickSummary {
        let now = time::epoch_seconds();
        let jobs = self.queue.snapshot();
        let mut summary = TickSummary {
            queued: jobs.len(),
            ..TickSummary::default()
        };

        if !jobs.is_empty() {
            relay!(
                level = DEBUG,
                "Retry histogram (attempts: jobs): {:?}",
                retry_histogram(&jobs)
            );
        }

        let (exhausted, live): (Vec<_>, Vec<_>) = jobs
            .into_iter()
            .partition(|job| self.policy.is_exhausted(job));

        for job in exhausted {
            if self.expire(job).await {
                summary.expired += 1;
            }
        }

        let eligible: Vec<RelayJob> = live
            .into_iter()
            .filter(|job| self.policy.is_eligible(job, now))
            .take(self.config.max_dequeue_per_tick)
            .collect();
        summary.attempted = eligible.len();

        let mut attempts = self.dispatch(eligible);
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((job, result)) => self.record(job, result, &mut summary).await,
                Err(err) => internal!(level = ERROR, "Delivery attempt task failed: {err}"),
            }
        }

        let next = now.saturating_add(self.period().as_secs());
        self.schedule.record_run(now, next);

        if summary != TickSummary::default() {
            relay!(
                level = INFO,
                "Tick: {} queued, {} attempted, {} delivered, {} retried, {} expired",
                summary.queued,
                summary.attempted,
                summary.delivered,
                summary.retried,
                summary.expired
            );
        }

        summary
    }

    /// Start one task per job, at most `max_concurrent_deliveries` of which
    /// run at a time. No store lock is held while they run.
    fn dispatch(
        &self,
        jobs: Vec<RelayJob>,
    ) -> JoinSet<(RelayJob, Result<DeliveryReport, DeliveryError>)> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries.max(1)));
        let deadline = self.config.attempt_timeout_secs;
        let mut attempts = JoinSet::new();

        for job in jobs {
            let agent = Arc::clone(&self.agent);
            let permits = Arc::clone(&permits);

            attempts.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (job, Err(DeliveryError::Temporary("worker pool closed".into())));
                };

                relay!(
                    level = DEBUG,
                    "Attempting job {} via {} (attempt {})",
                    job.id,
                    job.protocol,
                    job.attempt_count + 1
                );

                // A panicking or overrunning agent settles as a failed attempt.
                let attempt = tokio::spawn({
                    let job = job.clone();
                    async move { agent.deliver(&job).await }
                });
                let abort = attempt.abort_handle();

                let result = match tokio::time::timeout(Duration::from_secs(deadline), attempt).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(err)) => Err(DeliveryError::Temporary(format!(
                        "delivery attempt aborted: {err}"
                    ))),
                    Err(_) => {
                        abort.abort();
                        Err(DeliveryError::Timeout(deadline))
                    }
                };
                (job, result)
            });
        }

        attempts
    }

    async fn record(
        &self,
        job: RelayJob,
        result: Result<DeliveryReport, DeliveryError>,
        summary: &mut TickSummary,
    ) {
        match settle(&job, result) {
            Settlement::Delivered { bodies } => match self.queue.remove_by_id(&job.id).await {
                Ok(removed) => {
                    if removed {
                        relay!(level = INFO, "Delivered job {}", job.id);
                        summary.delivered += 1;
                    }
                    self.bodies.release(&self.queue, bodies).await;
                }
                Err(err) => {
                    internal!(level = ERROR, "Failed to remove delivered job {}: {err}", job.id);
                }
            },
            Settlement::Retry {
                remaining,
                bodies,
                reason,
            } => {
                let attempted_at = time::epoch_seconds();
                let updated = self
                    .queue
                    .update(&job.id, move |current| {
                        current.payload = remaining;
                        current.record_attempt(attempted_at);
                    })
                    .await;

                match updated {
                    Ok(Some(updated)) => {
                        summary.retried += 1;
                        relay!(
                            level = INFO,
                            "Attempt {} of job {} failed: {reason}; next attempt after {}",
                            updated.attempt_count,
                            job.id,
                            time::format_epoch(
                                self.policy
                                    .next_attempt_at(updated.attempt_count, attempted_at)
                            )
                        );
                    }
                    Ok(None) => {
                        relay!(level = DEBUG, "Job {} left the queue during its attempt", job.id);
                    }
                    Err(err) => {
                        internal!(level = ERROR, "Failed to record attempt for job {}: {err}", job.id);
                    }
                }

                self.bodies.release(&self.queue, bodies).await;
            }
        }
    }

    /// Remove an exhausted job and hand it to the bounce handler. Returns
    /// whether this call removed it.
    async fn expire(&self, job: RelayJob) -> bool {
        match self.queue.remove_by_id(&job.id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                internal!(level = ERROR, "Failed to remove exhausted job {}: {err}", job.id);
                return false;
            }
        }

        relay!(
            level = WARN,
            "Job {} exhausted after {} attempt(s); giving up",
            job.id,
            job.attempt_count
        );

        if let Err(err) = self.bounces.bounce(&job).await {
            relay!(level = ERROR, "Bounce of job {} failed: {err}", job.id);
        }
        self.bodies.release(&self.queue, job.body_paths()).await;

        true
    }
}
