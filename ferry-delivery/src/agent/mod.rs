//! The boundary between the queue and whatever actually moves mail.
//!
//! Wire protocols live behind [`DeliveryAgent`]; the worker only sees a
//! per-envelope report or a whole-attempt error.

mod pipe;
mod router;

use async_trait::async_trait;
use ferry_queue::RelayJob;

pub use pipe::PipeAgent;
pub use router::DeliveryRouter;

use crate::error::DeliveryError;

/// How one envelope fared in an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    Delivered,
    /// `recipients` lists those not accepted; empty means all of them.
    Failed {
        recipients: Vec<String>,
        reason: String,
    },
}

impl EnvelopeOutcome {
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            recipients: Vec::new(),
            reason: reason.into(),
        }
    }
}

/// Outcomes in the same order as the job's envelopes. Envelopes without an
/// entry are treated as failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    outcomes: Vec<EnvelopeOutcome>,
}

impl DeliveryReport {
    /// Every one of `envelopes` envelopes went through.
    #[must_use]
    pub fn delivered(envelopes: usize) -> Self {
        Self {
            outcomes: vec![EnvelopeOutcome::Delivered; envelopes],
        }
    }

    #[must_use]
    pub const fn from_outcomes(outcomes: Vec<EnvelopeOutcome>) -> Self {
        Self { outcomes }
    }

    #[must_use]
    pub fn outcomes(&self) -> &[EnvelopeOutcome] {
        &self.outcomes
    }

    #[must_use]
    pub fn outcome(&self, envelope: usize) -> Option<&EnvelopeOutcome> {
        self.outcomes.get(envelope)
    }
}

/// Something that can attempt delivery of a relay job.
///
/// Called outside any queue lock and possibly concurrently for different
/// jobs; implementations must not touch the queue themselves.
#[async_trait]
pub trait DeliveryAgent: Send + Sync {
    async fn deliver(&self, job: &RelayJob) -> Result<DeliveryReport, DeliveryError>;
}
