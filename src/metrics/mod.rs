//! Online measurement primitives: counters, TSC-based timing, and
//! windowed-quantile summaries.

mod atree;
mod counter;
mod stopwatch;
mod summary;

pub use counter::Counter;
pub use stopwatch::{Split, Stopwatch};
pub use summary::{Sample, Summary};

/// Metrics of the same kind and name can be merged, e.g. to combine the
/// per-thread results of a benchmark run.
pub trait Accumulate<Rhs = Self> {
    /// Fold `other` into `self`. Fails with `FailedPrecondition` when
    /// the metric names differ.
    fn accumulate(&mut self, other: &Rhs) -> crate::Result<()>;
}
