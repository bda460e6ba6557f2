//! Retrying delivery of queued relay jobs.
//!
//! A [`RetryWorker`] periodically snapshots the [`ferry_queue::RelayQueue`],
//! filters it through the [`RetryPolicy`], hands eligible jobs to a
//! [`DeliveryAgent`] and writes each outcome back to the queue. Jobs that run
//! out of attempts are removed and passed to a [`BounceHandler`].

pub mod agent;
pub mod bounce;
pub mod dsn;
pub mod error;
pub mod policy;
pub mod worker;

pub use agent::{DeliveryAgent, DeliveryReport, DeliveryRouter, EnvelopeOutcome, PipeAgent};
pub use bounce::{BounceHandler, DiscardBounces};
pub use dsn::{DsnBounces, DsnConfig};
pub use error::DeliveryError;
pub use policy::RetryPolicy;
pub use worker::{RetryWorker, SchedulerStatus, TickSummary, WorkerConfig, WorkerHandle};
