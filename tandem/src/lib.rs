//! Tandem: building blocks for cooperative lock-free containers.
//!
//! This crate holds the leaf layer shared by the tandem containers:
//!
//! - **Slots**: [`SlotCell`] and [`SlotArray`], wait-free CAS-protected cells
//!   whose state is a [`Slot`] (`Empty` or `Occupied`).
//! - **Versions**: [`VersionProvider`] issues totally ordered
//!   [`VersionToken`]s that survive sequence rollover by opening new epochs.
//! - **Cooperative resize**: [`ResizeProtocol`] drives a [`ResizeStatus`]
//!   machine that any thread can advance; containers plug in through the
//!   [`Growable`] trait.
//!
//! Memory of replaced values is reclaimed with `crossbeam-epoch`.
//!
//! # Example
//!
//! ```rust
//! use tandem::{pin, Slot, SlotArray};
//!
//! let slots = SlotArray::new(8);
//! assert!(slots.try_insert(3, "hello"));
//! assert!(!slots.try_insert(3, "world"));
//!
//! let guard = pin();
//! assert_eq!(slots.get(3, &guard), Slot::Occupied(&"hello"));
//! assert!(slots.try_remove(3));
//! assert_eq!(slots.get(3, &guard), Slot::Empty);
//! ```

#![warn(missing_docs)]

mod error;
mod priority;
pub mod resize;
pub mod slots;
pub mod status;
pub mod version;

pub use error::{doubled, Error, Result};
pub use resize::{Growable, ResizeProtocol, Working};
pub use slots::{Slot, SlotArray, SlotCell};
pub use status::{ResizeStatus, StatusCell};
pub use version::{AtomicVersionToken, VersionProvider, VersionToken};

// Re-export for convenience
pub use crossbeam_epoch::{pin, Guard};
