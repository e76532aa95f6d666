//! Resize status machine.

use core::sync::atomic::{AtomicU8, Ordering};

/// Phase of a cooperative resize.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizeStatus {
    /// No resize in flight; operations run directly on the current buffer.
    Stable = 0,
    /// Some thread ran out of room and asked for a bigger buffer.
    GrowRequested = 1,
    /// One thread is allocating and publishing the bigger buffer.
    SwappingTables = 2,
    /// Threads are draining the previous buffer into the current one.
    Copying = 3,
    /// The previous buffer is being released.
    Finalizing = 4,
}

impl ResizeStatus {
    #[inline]
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ResizeStatus::Stable,
            1 => ResizeStatus::GrowRequested,
            2 => ResizeStatus::SwappingTables,
            3 => ResizeStatus::Copying,
            _ => ResizeStatus::Finalizing,
        }
    }
}

/// Atomic holder of a [`ResizeStatus`].
///
/// The status only moves through the named transitions below, each a single
/// compare-and-swap, so exactly one thread performs any given step.
pub struct StatusCell {
    state: AtomicU8,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    /// Creates a cell in [`ResizeStatus::Stable`].
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ResizeStatus::Stable as u8),
        }
    }

    /// Reads the current status.
    #[inline]
    pub fn load(&self) -> ResizeStatus {
        ResizeStatus::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns `true` while no resize is in flight.
    #[inline]
    pub fn is_stable(&self) -> bool {
        self.load() == ResizeStatus::Stable
    }

    #[inline]
    fn transition(&self, from: ResizeStatus, to: ResizeStatus) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `Stable -> GrowRequested`
    pub fn request_grow(&self) -> bool {
        self.transition(ResizeStatus::Stable, ResizeStatus::GrowRequested)
    }

    /// `GrowRequested -> SwappingTables`
    pub fn begin_swap(&self) -> bool {
        self.transition(ResizeStatus::GrowRequested, ResizeStatus::SwappingTables)
    }

    /// `SwappingTables -> GrowRequested`, used when the swap could not complete.
    pub fn abort_swap(&self) -> bool {
        self.transition(ResizeStatus::SwappingTables, ResizeStatus::GrowRequested)
    }

    /// `SwappingTables -> Copying`
    pub fn begin_copy(&self) -> bool {
        self.transition(ResizeStatus::SwappingTables, ResizeStatus::Copying)
    }

    /// `Copying -> Finalizing`
    pub fn begin_finalize(&self) -> bool {
        self.transition(ResizeStatus::Copying, ResizeStatus::Finalizing)
    }

    /// `Finalizing -> Stable`
    pub fn finish(&self) -> bool {
        self.transition(ResizeStatus::Finalizing, ResizeStatus::Stable)
    }
}
