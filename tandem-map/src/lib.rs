//! Lock-free growable hash table with cooperative resizing.
//!
//! Two layers:
//!
//! - [`FixedTable`]: a fixed-capacity open-addressing table with linear
//!   probing. Slots are bound to keys with a single CAS and keep their key
//!   until the table is discarded.
//! - [`HashMap`]: owns the current `FixedTable` and swaps in one of double
//!   capacity when a writer exhausts its probe budget. The resize runs on the
//!   [`tandem::ResizeProtocol`]: whichever threads run into it advance it and
//!   share the copying.
//!
//! # Features
//!
//! - **Lock-Free**: every operation completes without locks; threads that
//!   meet a resize help finish it instead of waiting on a owner.
//! - **Linearizable**: inserts, updates, lookups and removals appear to take
//!   effect atomically, including across a resize.
//! - **FoldHash**: `foldhash::fast::FixedState` is the default hasher.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use tandem_map::{HashMap, MapOptions};
//!
//! let map = Arc::new(HashMap::with_options(MapOptions::new(16, 4)).unwrap());
//!
//! let handles: Vec<_> = (0..4u32)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 map.insert(t * 100 + i, i);
//!             }
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//!
//! assert_eq!(map.len(), 400);
//! assert_eq!(map.get(&205), Some(5));
//! ```

#![warn(missing_docs)]

mod error;
pub mod fixed;
mod iter;
mod map;

pub use error::MapError;
pub use fixed::{Bind, Bucket, FixedTable, Probe};
pub use iter::{Iter, Keys, Values};
pub use map::{HashMap, MapOptions, DEFAULT_CAPACITY, DEFAULT_MAX_PROBING};
