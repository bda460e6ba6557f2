//! What happens to a job that leaves the queue undelivered.

use async_trait::async_trait;
use ferry_common::relay;
use ferry_queue::RelayJob;

use crate::error::DeliveryError;

/// Called once per job after it has been removed from the queue because it
/// was exhausted or an operator bounced it. Failures are logged by the caller
/// and never put the job back.
#[async_trait]
pub trait BounceHandler: Send + Sync {
    async fn bounce(&self, job: &RelayJob) -> Result<(), DeliveryError>;
}

/// Drop the job without telling anyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardBounces;

#[async_trait]
impl BounceHandler for DiscardBounces {
    async fn bounce(&self, job: &RelayJob) -> Result<(), DeliveryError> {
        relay!(
            level = INFO,
            "Discarding job {} after {} attempt(s), {} recipient(s) undelivered",
            job.id,
            job.attempt_count,
            job.recipient_count()
        );
        Ok(())
    }
}
