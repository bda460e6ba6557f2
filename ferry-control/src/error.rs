use ferry_queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Neither `id` nor `ids` was supplied.
    #[error("Request names no target: expected `id` or `ids`")]
    MissingTarget,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Malformed request: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    /// The caller sent something unacceptable, as opposed to the queue
    /// failing underneath it.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        match self {
            Self::MissingTarget | Self::InvalidRequest(_) | Self::Json(_) => true,
            Self::Queue(err) => err.is_rejection(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
