use thiserror::Error;

/// Errors raised while configuring or growing tandem containers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A container was requested with no room at all.
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
    /// The probe budget does not fit the table it is meant for.
    #[error("max probing {max_probing} must satisfy 1 <= max probing < {capacity}")]
    ProbingOutOfRange {
        /// Requested probe budget.
        max_probing: usize,
        /// Table capacity after rounding.
        capacity: usize,
    },
    /// Doubling the capacity would overflow `usize`.
    #[error("capacity {capacity} cannot be doubled")]
    CapacityOverflow {
        /// Capacity that was about to be doubled.
        capacity: usize,
    },
    /// The allocator refused a new buffer.
    #[error("failed to allocate {capacity} slots")]
    AllocationFailed {
        /// Number of slots requested.
        capacity: usize,
    },
}

/// Result alias used across the tandem crates.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Doubles `capacity`, reporting overflow instead of wrapping.
pub fn doubled(capacity: usize) -> Result<usize> {
    capacity
        .checked_mul(2)
        .ok_or(Error::CapacityOverflow { capacity })
}
