use thiserror::Error;

/// Errors reported by [`HashMap`](crate::HashMap).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    /// [`HashMap::add`](crate::HashMap::add) found the key already present.
    #[error("an item with the same key has already been added")]
    DuplicateKey,
    /// The table configuration was rejected.
    #[error(transparent)]
    Config(#[from] tandem::Error),
}
