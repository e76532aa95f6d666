//! Growable MPMC queue for tandem.
//!
//! ## Features
//!
//! - `FixedQueue`: bounded MPMC ring buffer with per-cell stamps.
//! - `GrowQueue`: unbounded MPMC queue that doubles its ring when full,
//!   using the cooperative resize protocol from `tandem`. FIFO order is kept
//!   across resizes.
//!
//! ## Usage
//!
//! ```rust
//! use tandem_queue::GrowQueue;
//!
//! let queue = GrowQueue::with_capacity(2);
//! for i in 0..10 {
//!     queue.push(i);
//! }
//! assert!(queue.capacity() >= 10);
//! assert_eq!(queue.pop(), Some(0));
//! assert_eq!(queue.drain().count(), 9);
//! ```

pub mod fixed;
pub mod grow;

pub use fixed::FixedQueue;
pub use grow::{Drain, GrowQueue, QueueOptions, DEFAULT_CAPACITY};
