//! Pinned, HCA-registered memory.

use std::io;
use std::ptr::NonNull;

use anyhow::{Context as _, Result};
use rdma_sys::*;

use crate::rdma::device::Pd;

const HUGE_PAGE_PATH: &str = "/proc/sys/vm/nr_hugepages";
const HUGE_PAGE_SIZE: usize = 2 << 20;

/// A pinned region of anonymous memory registered with the HCA.
///
/// When the host has huge pages configured (`/proc/sys/vm/nr_hugepages`
/// > 0) the backing mapping is `MAP_HUGETLB`; otherwise ordinary pages
/// are used. Registration grants local write plus remote read, write,
/// and atomic access, so the region can serve as both the source and
/// target of every verb the library issues.
pub struct PinnedMemory {
    addr: *mut u8,
    len: usize,
    mapped_len: usize,
    huge: bool,
    mr: NonNull<ibv_mr>,
    _pd: Pd,
}

unsafe impl Send for PinnedMemory {}
unsafe impl Sync for PinnedMemory {}

impl PinnedMemory {
    /// Map `len` bytes and register them under `pd`.
    pub fn new(len: usize, pd: Pd) -> Result<Self> {
        let (addr, mapped_len, huge) = Self::map(len)?;

        let mr = unsafe {
            ibv_reg_mr(
                pd.as_raw(),
                addr as *mut libc::c_void,
                len,
                (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
                    .0 as i32,
            )
        };
        let mr = NonNull::new(mr).ok_or_else(|| {
            unsafe { libc::munmap(addr as *mut libc::c_void, mapped_len) };
            anyhow::anyhow!("ibv_reg_mr failed: {}", io::Error::last_os_error())
        })?;

        log::debug!(
            "pinned {} bytes @ {:p} (huge pages: {})",
            len,
            addr,
            huge
        );
        Ok(Self { addr, len, mapped_len, huge, mr, _pd: pd })
    }

    fn map(len: usize) -> Result<(*mut u8, usize, bool)> {
        let want_huge = std::fs::read_to_string(HUGE_PAGE_PATH)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|n| n > 0)
            .unwrap_or(false);

        if want_huge {
            let mapped_len = len.next_multiple_of(HUGE_PAGE_SIZE);
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mapped_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if addr != libc::MAP_FAILED {
                return Ok((addr as *mut u8, mapped_len, true));
            }
            log::warn!(
                "huge-page mmap of {} bytes failed ({}), falling back to regular pages",
                mapped_len,
                io::Error::last_os_error()
            );
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| format!("mmap of {} bytes failed", len));
        }
        Ok((addr as *mut u8, len, false))
    }

    /// Base address of the region.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Registered length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region is backed by huge pages.
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.huge
    }

    #[inline]
    pub fn mr(&self) -> *mut ibv_mr {
        self.mr.as_ptr()
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }
}

impl Drop for PinnedMemory {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr.as_ptr());
            libc::munmap(self.addr as *mut libc::c_void, self.mapped_len);
        }
    }
}
