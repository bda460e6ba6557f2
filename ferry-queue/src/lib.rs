//! Durable storage for pending relay jobs.
//!
//! [`RelayQueue`] holds the jobs themselves; [`BodyStore`] holds the message
//! content they point at. Jobs only ever reference bodies on disk.

pub mod body;
pub mod config;
pub mod error;
pub mod job;
mod lock;
pub mod store;

pub use body::BodyStore;
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use job::{DEFAULT_PROTOCOL, Envelope, JobId, MessageBody, RelayJob, retry_histogram};
pub use store::RelayQueue;
