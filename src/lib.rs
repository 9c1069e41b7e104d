//! # MPI Runtime
//!
//! A pure-userspace message-passing runtime: a fixed-size cohort of
//! processes, each owning a unique rank, exchanges typed messages and
//! invokes collective operations (broadcast, reduce, scatter, gather,
//! allgather, all-to-all, barrier, scan) over persistent TCP connections.
//!
//! Each process hosts one communication engine ([`Mpi`]) whose lifetime
//! brackets the program between [`Mpi::init`] and [`Mpi::finalize`]. The
//! engine multiplexes point-to-point traffic over a full peer mesh, matches
//! arrivals against posted receives while buffering the unmatched, and
//! drives collective operations whose algorithm is selected from a family
//! of topology-based strategies and may be re-selected dynamically on
//! receiving peers.

pub mod collective;
pub mod communicator;
pub mod engine;
pub mod error;
pub mod group;
mod logging;
pub mod op;
pub mod request;
pub mod serializer;
pub mod settings;
pub mod topology;
pub mod transport;
pub mod wire;

pub use communicator::Communicator;
pub use engine::{Mpi, ProcessConfig};
pub use error::MpiError;
pub use group::{Group, GroupCompare};
pub use op::Op;
pub use request::{testall, testany, waitall, waitany, RequestHandle, RequestStatus};
pub use serializer::{DenseArray, ElementType, Value};
pub use settings::Settings;
pub use transport::PeerAddr;
pub use wire::{CommId, Rank, Tag, ANY_SOURCE, ANY_TAG, UNDEFINED};

/// The current version of the runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
