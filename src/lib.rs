//! Petek: a lock-free, fixed-bucket concurrent hash table with epoch-based
//! memory reclamation.
//!
//! The table is a fixed array of buckets; each bucket is an ordered chain
//! whose entries carry a mark bit in their successor word for two-phase
//! removal. No operation takes a lock: inserts and unlinks land with single
//! compare-and-swaps, and walkers sweep out marked runs as they pass.
//!
//! # Key Properties
//!
//! - **Lock-Free Buckets**: insert, lookup, update and erase make progress
//!   under any interleaving; contention only costs retries
//! - **Epoch Reclamation**: unlinked entries wait in a per-worker queue
//!   until every worker has announced an epoch past their stamp
//! - **Thread-Local Allocation**: each worker owns a single-size-class
//!   freelist pool; the hot path never touches a shared allocator
//! - **Fixed Footprint**: the bucket array never grows and the pool serves
//!   exactly one size class
//!
//! # Workers
//!
//! Callers thread a [`WorkerState`] through every operation. Register one
//! per thread, keep it on that thread, and let mutating traffic (or an
//! explicit [`WorkerState::quiesce`] on read-only threads) pace the
//! reclamation cycle.
//!
//! # Example
//!
//! ```
//! use petek::Petek;
//!
//! let table: Petek<u64, u64> = Petek::new(128);
//! let mut worker = table.worker().unwrap();
//!
//! assert!(table.put(&mut worker, 7, 700).unwrap());
//! assert_eq!(table.get(&mut worker, &7), Some(700));
//! assert_eq!(table.update(&mut worker, &7, |v| v + 1), Some(700));
//! assert_eq!(table.get(&mut worker, &7), Some(701));
//! assert!(table.erase(&mut worker, &7));
//! assert_eq!(table.get(&mut worker, &7), None);
//! ```

#![warn(missing_docs)]

mod epoch;
mod errors;
mod list;
mod node;
mod pool;
mod table;
mod worker;

pub use errors::Error;
pub use pool::{BlockPool, FixedArena, Heap, PoolStats, Upstream};
pub use table::{Config, Petek};
pub use worker::WorkerState;
