//! Typed error handling for delivery attempts.
//!
//! The worker treats every failure the same way (count the attempt, wait,
//! try again until exhausted); the classification drives how loudly it is
//! logged and what a bounce reports.

use ferry_queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The destination deferred; trying again later may succeed.
    #[error("Temporary failure: {0}")]
    Temporary(String),

    /// The destination refused outright.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// No agent is registered for the job's protocol.
    #[error("No delivery agent for protocol {0:?}")]
    UnsupportedProtocol(String),

    /// The attempt did not finish in time.
    #[error("Delivery attempt timed out after {0}s")]
    Timeout(u64),

    /// Local I/O while preparing or handing off the message.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading from or writing to the queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_) | Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_) | Self::UnsupportedProtocol(_))
    }

    /// Enhanced status code (RFC 3463) reported in bounces.
    #[must_use]
    pub const fn status_code(&self) -> &'static str {
        match self {
            Self::Temporary(_) => "4.0.0",
            Self::Timeout(_) => "4.4.7",
            Self::Permanent(_) => "5.0.0",
            Self::UnsupportedProtocol(_) => "5.3.0",
            Self::Io(_) | Self::Queue(_) => "4.3.0",
        }
    }
}
