//! Error taxonomy for the message-passing runtime.
//!
//! Parameter-validation errors (`NoSuchRank`, `InvalidRange`, `InvalidStride`,
//! plain `Mpi`) are raised synchronously at the call site and leave the engine
//! untouched. `Serialization` and `Transport` faults are unrecoverable: the
//! engine logs them and terminates the process, which the launcher observes
//! as a non-zero exit.

use crate::wire::Rank;
use thiserror::Error;

/// All errors surfaced by the runtime.
#[derive(Error, Debug)]
pub enum MpiError {
    /// Generic runtime fault, e.g. an invalid request kind or a collective
    /// invoked with malformed arguments.
    #[error("MPI runtime error: {0}")]
    Mpi(String),

    /// A rank outside the group's range was passed to `translate_ranks` or a
    /// point-to-point operation.
    #[error("no such rank {rank} in group of size {size}")]
    NoSuchRank { rank: Rank, size: usize },

    /// A malformed `(first, last, stride)` triplet in `range_incl`/`range_excl`.
    #[error("invalid range triplet ({first}, {last}, {stride})")]
    InvalidRange { first: Rank, last: Rank, stride: Rank },

    /// A zero stride in a range triplet.
    #[error("invalid stride {0} in range triplet")]
    InvalidStride(Rank),

    /// Payload encode/decode failure. Fatal on the receiving side.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Connection loss or a framing violation. Fatal to the process.
    #[error("transport failure: {0}")]
    Transport(String),

    /// `wait` was called on a cancelled request.
    #[error("wait on cancelled request")]
    Cancelled,
}

impl From<bincode::Error> for MpiError {
    fn from(err: bincode::Error) -> Self {
        MpiError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MpiError {
    fn from(err: std::io::Error) -> Self {
        MpiError::Transport(err.to_string())
    }
}
