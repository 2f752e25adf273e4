//! Slab-class sub-allocation over a registered arena.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Smallest slab class, 2^3 = 8 bytes.
const MIN_SLAB_CLASS: u32 = 3;
/// Largest slab class, 2^20 = 1 MiB.
const MAX_SLAB_CLASS: u32 = 20;
const NUM_SLAB_CLASSES: usize = (MAX_SLAB_CLASS - MIN_SLAB_CLASS + 1) as usize;

/// Default alignment handed to typed allocations.
pub const SLAB_ALIGNMENT: usize = 64;

#[inline]
fn upper_log2(x: usize) -> u32 {
    if x <= 1 {
        0
    } else {
        usize::BITS - (x - 1).leading_zeros()
    }
}

/// A slab/freelist resource over a contiguous arena.
///
/// Allocation requests are bucketed by `ceil(log2(bytes))`, clamped to
/// [8 B, 1 MiB]. Fresh regions come from a bump head that starts at
/// `base + capacity` and moves downward under CAS; freed regions rejoin
/// the free list of their size class and are zeroed on reuse. Free lists
/// are per-class and mutex-protected, so a single resource may serve
/// many threads.
///
/// The resource does not touch the arena's registration; callers pair it
/// with a [`PinnedMemory`](crate::PinnedMemory) (or, in tests, any plain
/// buffer).
pub struct SlabResource {
    base: u64,
    capacity: usize,
    head: AtomicU64,
    freelists: [Mutex<Vec<(usize, u64)>>; NUM_SLAB_CLASSES],
}

impl SlabResource {
    pub fn new(base: *mut u8, capacity: usize) -> Self {
        let base = base as u64;
        log::debug!(
            "slab resource: 0x{:x} to 0x{:x} (length={})",
            base,
            base + capacity as u64,
            capacity
        );
        Self {
            base,
            capacity,
            head: AtomicU64::new(base + capacity as u64),
            freelists: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    #[inline]
    fn class_index(bytes: usize) -> usize {
        let class = upper_log2(bytes).clamp(MIN_SLAB_CLASS, MAX_SLAB_CLASS);
        assert!(
            bytes <= 1 << MAX_SLAB_CLASS,
            "allocation of {} bytes exceeds the largest slab class",
            bytes
        );
        (class - MIN_SLAB_CLASS) as usize
    }

    /// Allocate `bytes` with the given power-of-two `alignment`. Returns
    /// a null pointer when the arena is exhausted.
    pub fn allocate(&self, mut bytes: usize, alignment: usize) -> *mut u8 {
        debug_assert!(alignment.is_power_of_two());
        if alignment > bytes {
            bytes = alignment;
        }
        let idx = Self::class_index(bytes);

        {
            let mut freelist = self.freelists[idx].lock().unwrap();
            if let Some(pos) = freelist.iter().position(|&(a, _)| a >= alignment) {
                let (_, addr) = freelist.swap_remove(pos);
                drop(freelist);
                unsafe {
                    std::ptr::write_bytes(addr as *mut u8, 0, 1 << (idx as u32 + MIN_SLAB_CLASS))
                };
                log::trace!("(re)allocated {} bytes @ 0x{:x}", bytes, addr);
                return addr as *mut u8;
            }
        }

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let next = (head & !(alignment as u64 - 1)).wrapping_sub(bytes as u64);
            if next < self.base {
                log::error!("slab resource out of memory ({} bytes requested)", bytes);
                return std::ptr::null_mut();
            }
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    log::trace!("allocated {} bytes @ 0x{:x}", bytes, next);
                    return next as *mut u8;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Return a previously allocated region to its size class.
    pub fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
        let bytes = bytes.max(alignment);
        let idx = Self::class_index(bytes);
        log::trace!("deallocating {} bytes @ {:p}", bytes, ptr);
        self.freelists[idx]
            .lock()
            .unwrap()
            .push((alignment, ptr as u64));
    }

    /// Allocate room for `n` values of `T` at the default 64-byte
    /// alignment.
    pub fn allocate_t<T>(&self, n: usize) -> *mut T {
        self.allocate(std::mem::size_of::<T>() * n, SLAB_ALIGNMENT) as *mut T
    }

    /// Return `n` values of `T` allocated by [`SlabResource::allocate_t`].
    pub fn deallocate_t<T>(&self, ptr: *mut T, n: usize) {
        self.deallocate(ptr as *mut u8, std::mem::size_of::<T>() * n, SLAB_ALIGNMENT);
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `addr` lies within the arena.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.capacity as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn arena(capacity: usize) -> (Vec<u8>, SlabResource) {
        let mut buf = vec![0u8; capacity];
        let resource = SlabResource::new(buf.as_mut_ptr(), capacity);
        (buf, resource)
    }

    #[test]
    fn upper_log2_rounds_up() {
        assert_eq!(upper_log2(1), 0);
        assert_eq!(upper_log2(2), 1);
        assert_eq!(upper_log2(3), 2);
        assert_eq!(upper_log2(8), 3);
        assert_eq!(upper_log2(9), 4);
        assert_eq!(upper_log2(1 << 20), 20);
    }

    #[test]
    fn allocations_stay_in_bounds_and_aligned() {
        let (_buf, r) = arena(1 << 16);
        for _ in 0..100 {
            let p = r.allocate(48, 64) as u64;
            assert_ne!(p, 0);
            assert!(r.contains(p));
            assert_eq!(p % 64, 0);
        }
    }

    #[test]
    fn freed_regions_are_reused_and_zeroed() {
        let (_buf, r) = arena(1 << 12);
        let p = r.allocate(64, 64);
        unsafe { std::ptr::write_bytes(p, 0xab, 64) };
        r.deallocate(p, 64, 64);
        let q = r.allocate(64, 64);
        assert_eq!(p, q);
        let bytes = unsafe { std::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_returns_null() {
        let (_buf, r) = arena(256);
        let mut live = Vec::new();
        loop {
            let p = r.allocate(64, 64);
            if p.is_null() {
                break;
            }
            live.push(p);
        }
        assert!(!live.is_empty());
        assert!(live.len() <= 4);
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let capacity = 1 << 18;
        let mut buf = vec![0u8; capacity];
        let r = Arc::new(SlabResource::new(buf.as_mut_ptr(), capacity));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    (0..128)
                        .map(|_| r.allocate(64, 64) as u64)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert_ne!(addr, 0);
                assert!(r.contains(addr));
                assert_eq!(addr % 64, 0);
                // 64-byte granules must never overlap.
                assert!(seen.insert(addr));
            }
        }
    }

    #[test]
    fn small_requests_share_a_class_with_their_alignment() {
        let (_buf, r) = arena(1 << 12);
        let p = r.allocate_t::<u64>(1);
        assert_eq!(p as u64 % 64, 0);
        r.deallocate_t(p, 1);
        // An 8-byte request is padded up to its 64-byte alignment class.
        let q = r.allocate(8, 64);
        assert_eq!(p as *mut u8, q);
    }
}
