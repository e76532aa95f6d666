use thiserror::Error;

/// Errors surfaced by work contexts and work items.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    /// The owning context has been disposed.
    #[error("work context is disposed")]
    Disposed,
    /// `start` was called on an item that was already started.
    #[error("work item was already started")]
    AlreadyStarted,
    /// `wait` was called on an item that was never started.
    #[error("work item was not started")]
    NotStarted,
    /// The item's action panicked.
    #[error("work item panicked: {0}")]
    Panicked(String),
    /// A dedicated worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    /// The context configuration was rejected.
    #[error(transparent)]
    Config(#[from] tandem::Error),
}
