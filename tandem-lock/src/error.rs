use thiserror::Error;

/// Errors for lock slot operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The context configuration was rejected.
    #[error(transparent)]
    Config(#[from] tandem::Error),
    /// More slots were requested than a context supports.
    #[error("a lock context holds at most {max} slots, {requested} requested")]
    TooManySlots {
        /// Requested slot count.
        requested: usize,
        /// Upper bound.
        max: usize,
    },
    /// The lock is held by another slot.
    #[error("lock is held by slot {owner}")]
    Held {
        /// Id of the holding slot.
        owner: usize,
    },
    /// The slot was claimed from a different context than the lock uses.
    #[error("slot belongs to a different lock context")]
    ForeignSlot,
}
