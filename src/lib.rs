//! A lock-free hash map from `i32` keys to values, plus the self-scaling
//! worker pool its bulk operations run on.
//!
//! # The map
//!
//! [`IntMap`] keeps its entries in immutable singly-linked chains hanging off
//! an atomic bucket table. Readers walk chains with nothing but guarded
//! loads; writers replace a bucket's chain with a single compare-and-swap of
//! its head, copying the surviving entries instead of mutating them. Point
//! operations never block and never fail.
//!
//! Growth is cooperative. The insert that crosses the load-factor threshold
//! allocates a doubled table and starts draining buckets into it, marking
//! each drained bucket with a sentinel. Any other thread that stumbles onto
//! a sentinel does not wait its turn — it grabs a chunk of not-yet-drained
//! buckets from the tail of the table and drains them itself, so the more
//! threads hammer a resizing map, the faster the resize finishes.
//!
//! Scan-style operations are split by contract. The iterators
//! ([`IntMap::iter`] and friends) traverse *through* a resize, helping it
//! along where needed, and are weakly consistent. The raw scans
//! ([`IntMap::for_each`], [`IntMap::parallel_for_each`], and serialization)
//! fail fast with [`ConcurrentModification`] when they observe a resize,
//! because a half-drained table cannot be scanned coherently.
//!
//! # A note on `Guard`s
//!
//! Entries are reclaimed through [`seize`]: memory that a concurrent reader
//! might still see is retired, not freed, and only reclaimed once every
//! [`Guard`] that could have observed it is gone. Acquire guards with
//! [`IntMap::guard`], and acquire them briefly — a long-lived guard holds up
//! reclamation of everything retired while it exists. A guard from one map
//! cannot be used with another.
//!
//! # The pool
//!
//! [`WorkerPool`] runs submitted closures on a capped set of worker threads
//! that spawn on demand and retire themselves after an idle timeout, with no
//! manager thread; all coordination is a single packed atomic word. A
//! panicking task aborts the whole pool by default, which is the right
//! default for the batch pipelines it is built for.
//!
//! # Examples
//!
//! ```
//! use scurry::IntMap;
//!
//! let map = IntMap::new();
//!
//! {
//!     let guard = map.guard();
//!     map.insert(7, "seven", &guard);
//!     map.insert(8, "eight", &guard);
//!     assert_eq!(map.get(7, &guard), Some(&"seven"));
//! }
//!
//! let guard = map.guard();
//! assert_eq!(map.iter(&guard).count(), 2);
//! ```
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

mod counter;
mod map;
mod node;
mod pool;
mod raw;
mod reclaim;

pub mod iter;

#[cfg(feature = "serde")]
mod serde_impls;

pub use map::{ConcurrentModification, IntMap};
pub use pool::{Rejected, WorkerPool};

/// The guard type protecting loads from the map; see [`IntMap::guard`].
pub use seize::Guard;
