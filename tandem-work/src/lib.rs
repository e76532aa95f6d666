//! Lightweight work scheduler with exclusive work items.
//!
//! A [`WorkContext`] queues [`Work`] items on a growable lock-free queue and
//! runs them either on a bounded set of dedicated threads or on the rayon
//! global pool. Threads that [`wait`](Work::wait) for an item run other
//! queued items while they wait instead of idling.
//!
//! An item added with `exclusive = true` runs with no other item of its
//! context in flight: it raises a pause flag that holds back new items and
//! spins until the ones already running have finished.
//!
//! A panic inside an item is caught and stored on the item; it surfaces as
//! [`WorkError::Panicked`] from `wait`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use tandem_work::WorkContext;
//!
//! let context = WorkContext::builder()
//!     .name("example")
//!     .dedicated_threads(2)
//!     .build()
//!     .unwrap();
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let work: Vec<_> = (0..8)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         context
//!             .submit(move || {
//!                 counter.fetch_add(1, Ordering::Relaxed);
//!             }, false)
//!             .unwrap()
//!     })
//!     .collect();
//!
//! for w in &work {
//!     w.wait().unwrap();
//! }
//! assert_eq!(counter.load(Ordering::Relaxed), 8);
//! ```

#![warn(missing_docs)]

mod context;
mod error;
mod signal;
mod work;

pub use context::{WorkContext, WorkContextBuilder};
pub use error::WorkError;
pub use work::Work;
