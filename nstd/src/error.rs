// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
///
/// Invariant violations (lock-protocol misuse, boot-time exhaustion) are
/// kernel bugs and panic instead of surfacing here; everything that a
/// caller can reasonably react to is an `Error`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Invalid arguments provided.
    InvalidArgs,
    /// Insufficient physical memory or address space.
    NoMemory,
    /// The requested access is not permitted.
    AccessDenied,
    /// The requested item does not exist.
    NotFound,
    /// A bounded wait gave up; the operation may be retried.
    TimedOut,
    /// The operation would have to block on an in-flight population.
    WouldBlock,
    /// Arithmetic or capacity overflow.
    Overflow,
}

/// A specialized [`Result`] type for this crate.
pub type Result<T> = core::result::Result<T, Error>;
