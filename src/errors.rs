//! Error types surfaced by table and pool operations.

use core::fmt::Display;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;

/// Errors a caller can observe.
///
/// Contention never surfaces as an error; compare-and-swap retries are
/// internal. Contract violations (size-class mismatch, use of an
/// unregistered worker) are debug-checked panics, not values of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The upstream memory resource refused an allocation request.
    ///
    /// A `put` that fails this way leaves the table unchanged.
    AllocExhausted {
        /// Size in bytes of the refused request.
        size: usize,
    },
    /// Worker registration was attempted after every announcement slot
    /// had been claimed.
    WorkersExhausted {
        /// Number of slots the table was built with.
        max_workers: usize,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::AllocExhausted { size } => {
                write!(f, "upstream resource refused a {} byte allocation", size)
            }
            Error::WorkersExhausted { max_workers } => {
                write!(f, "all {} worker slots are claimed", max_workers)
            }
        }
    }
}

impl std::error::Error for Error {}
