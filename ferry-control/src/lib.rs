//! Management operations on a running relay queue: enqueue, paginated
//! listing, delete, manual retry, bounce and statistics.
//!
//! Requests and responses in [`protocol`] serialize as camelCase JSON, the
//! shape served to operators.

pub mod config;
pub mod error;
pub mod protocol;
pub mod service;

pub use config::ControlConfig;
pub use error::{ControlError, Result};
pub use protocol::{
    BounceResponse, DeleteResponse, EnqueueRequest, EnqueueResponse, EnvelopeRequest,
    EnvelopeSummary, JobSummary, ListQuery, ListResponse, RetryResponse, StatsResponse, Status,
    TargetIds,
};
pub use service::QueueService;
