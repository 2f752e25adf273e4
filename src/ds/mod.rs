//! Building blocks for lock-free data structures layered over the pool:
//! pointers that steal their alignment bits for marks, and the small
//! bitset they pack those marks into.

mod bitset;
mod marked_ptr;

pub use bitset::SmallBitset;
pub use marked_ptr::{AtomicMarkedPtr, MarkedPtr};
