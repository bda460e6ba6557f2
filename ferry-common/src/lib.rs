pub mod logging;
pub mod time;

pub use tracing;

/// Lifecycle notifications fanned out to every long running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
