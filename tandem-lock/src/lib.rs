//! Versioned, recyclable lock slots.
//!
//! A [`LockContext`] owns a fixed arena of slots. A thread claims a slot,
//! uses it to hold [`SlotLock`]s and publish values, and frees it again.
//! Every claim is stamped with a fresh [`tandem::VersionToken`], so among
//! several slots the most recent claimant is always identifiable, even after
//! the version provider rolls over into a new epoch.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_lock::{LockContext, SlotLock};
//!
//! let context = Arc::new(LockContext::new(8).unwrap());
//! let cell = SlotLock::new(Arc::clone(&context), 1u64);
//!
//! let slot = context.claim();
//! {
//!     let guard = cell.try_lock(&slot).unwrap();
//!     guard.capture(2);
//!     // Readers see the capture while the lock is held.
//!     assert_eq!(cell.value(), Some(2));
//! }
//! // Releasing the guard commits the captured value.
//! slot.free();
//! assert_eq!(cell.value(), Some(2));
//! ```

#![warn(missing_docs)]

mod cell;
mod context;
mod error;
mod flags;

pub use cell::{SlotGuard, SlotLock};
pub use context::{LockContext, LockSlot, MAX_SLOTS};
pub use error::LockError;
pub use flags::SlotFlags;
