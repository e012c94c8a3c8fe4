//! The error taxonomy for the LSA API.
//!
//! Every public operation returns `Result<T, LsaError>` instead of a bare
//! status code: precondition violations and resource-exhaustion failures
//! map one-to-one onto variants here. A thread killed by the fault
//! interceptor never surfaces as a `Result` at all — there is no return
//! from it.

use thiserror::Error;

/// Everything that can go wrong calling into the LSA API.
#[derive(Debug, Error)]
pub enum LsaError {
    /// `create` or `clone` was called by a thread that already owns an LSA.
    #[error("the calling thread already owns a local storage area")]
    AlreadyOwnsLsa,

    /// `destroy`, `read`, or `write` was called by a thread with no LSA.
    #[error("the calling thread does not own a local storage area")]
    NoLsa,

    /// `create` was called with `size == 0`.
    #[error("a local storage area must have a non-zero size")]
    ZeroSize,

    /// `read` or `write` addressed a range outside `[0, size)`, including
    /// the case where `offset + length` would overflow.
    #[error("the requested byte range is out of bounds for this local storage area")]
    OutOfBounds,

    /// `clone` named a thread with no registered LSA.
    #[error("the target thread has no registered local storage area")]
    UnknownThread,

    /// An anonymous page mapping could not be created.
    #[error("failed to map a backing page: {0}")]
    MapFailed(#[source] nix::Error),

    /// A page's protection could not be changed.
    #[error("failed to change page protection: {0}")]
    ProtectFailed(#[source] nix::Error),
}

pub type LsaResult<T = ()> = Result<T, LsaError>;
