//! A remote-memory toolkit for InfiniBand/RoCE fabrics.
//!
//! `remex` gives distributed applications a pool of pinned, remotely
//! addressable memory and a small set of primitives on top of it:
//! one-sided READ/WRITE, 8-byte atomic compare-and-swap, and a two-sided
//! message channel built from one-sided writes. Underneath, it manages
//! `rdma_cm` connection establishment (including the thorny
//! simultaneous-dial case and the loopback path), memory registration
//! with the HCA, and work-request completion signalling for many client
//! threads.
//!
//! It is built atop the [`rdma-sys`] crate. All RDMA resource holders
//! (`Context`, `Pd`, `Connection`) are `Arc`-based handles: clone them
//! freely to share the underlying resource across threads.
//!
//! Two auxiliary module trees round out the crate: [`bench`] holds a
//! composable operation-stream algebra, a workload driver, and a
//! token-bucket rate limiter; [`metrics`] holds the TSC stopwatch,
//! counters, and windowed-quantile summaries the driver records into.
//!
//! [`rdma-sys`]: https://docs.rs/rdma-sys/latest/rdma_sys/

#[cfg(not(target_os = "linux"))]
compile_error!("`remex` currently only supports Linux");

/// Shared util functions.
mod utils;

/// Status-carrying error type.
mod error;

/// RDMA data-plane and control-plane functionalities.
/// Not publicly exposed; necessary items are `pub use`d instead.
mod rdma;

pub use error::{Error, Result};

pub use rdma::alloc::*;
pub use rdma::broker::*;
pub use rdma::channel::*;
pub use rdma::connection::*;
pub use rdma::device::*;
pub use rdma::manager::*;
pub use rdma::memory::*;
pub use rdma::pool::*;
pub use rdma::remote_ptr::*;
pub use rdma::types::*;

/// Workload generation and driving: streams, client adaptors, QPS control.
pub mod bench;

/// Lock-free building blocks: marked pointers and small bitsets.
pub mod ds;

/// Online measurement: counters, TSC timing, windowed summaries.
pub mod metrics;
