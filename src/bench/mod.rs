//! Workload generation and driving.
//!
//! A [`stream::Stream`] lazily produces typed operations, a
//! [`driver::ClientAdaptor`] applies them to the system under test, and
//! the [`driver::WorkloadDriver`] pumps one into the other while
//! sampling latency and throughput. A [`qps::QpsController`] slots in
//! between to cap the offered load.

pub mod driver;
pub mod qps;
pub mod stream;

pub use driver::{ClientAdaptor, WorkloadDriver};
pub use qps::{Clock, LeakyTokenBucket, QpsController, SystemClock};
pub use stream::Stream;
