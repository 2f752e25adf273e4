//! The registered-memory pool and its RDMA operation dispatcher.
//!
//! A [`MemoryPool`] owns one pinned arena, a connection per peer, and
//! the per-peer rkeys learned during bootstrap. On top of those it
//! offers one-sided reads and writes of typed values, 8-byte remote
//! atomics, and doorbell-batched work-request chains.
//!
//! Completions are consumed in one of two modes. In the default private
//! mode the issuing thread busy-polls its connection's send CQ for
//! exactly one completion. In shared mode a single worker thread polls
//! every send CQ and wakes the issuing thread through a per-thread
//! mailbox; work-request ids carry the issuer's registered thread id so
//! the worker knows whom to wake.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rdma_sys::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::Summary;
use crate::rdma::alloc::SlabResource;
use crate::rdma::connection::Connection;
use crate::rdma::manager::ConnectionManager;
use crate::rdma::memory::PinnedMemory;
use crate::rdma::remote_ptr::RemotePtr;

/// Upper bound on threads that may register with a shared-mode pool.
pub const THREAD_MAX: usize = 50;

/// A participant in the memory pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: u16,
    pub address: String,
    pub port: u16,
}

impl Peer {
    pub fn new(id: u16, address: impl Into<String>, port: u16) -> Self {
        Self { id, address: address.into(), port }
    }
}

/// Bootstrap advertisement of one node's arena.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemoteObject {
    pub rkey: u32,
    pub raddr: u64,
}

/// What an operation needs to reach one peer's arena.
#[derive(Clone)]
pub struct ConnInfo {
    pub conn: Arc<Connection>,
    pub rkey: u32,
    pub lkey: u32,
}

/// Completion policy for [`MemoryPool::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Signal the WR and wait for its completion.
    #[default]
    WaitForResponse,
    /// Post unsignaled and return immediately.
    FireAndForget,
}

struct Mailbox {
    ready: Mutex<bool>,
    cv: Condvar,
}

struct SharedCompletions {
    run: AtomicBool,
    boxes: [Mailbox; THREAD_MAX],
}

impl SharedCompletions {
    fn new() -> Self {
        Self {
            run: AtomicBool::new(true),
            boxes: std::array::from_fn(|_| Mailbox {
                ready: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    fn signal(&self, tid: usize) {
        let mb = &self.boxes[tid];
        let mut ready = mb.ready.lock().unwrap();
        *ready = true;
        mb.cv.notify_one();
    }

    fn release_all(&self) {
        for tid in 0..THREAD_MAX {
            self.signal(tid);
        }
    }

    fn wait(&self, tid: usize, kill: Option<&AtomicBool>) {
        let mb = &self.boxes[tid];
        let mut ready = mb.ready.lock().unwrap();
        while !*ready {
            if !self.run.load(Ordering::Acquire) {
                return;
            }
            if let Some(kill) = kill {
                if kill.load(Ordering::Acquire) {
                    return;
                }
            }
            let (guard, _) = mb
                .cv
                .wait_timeout(ready, Duration::from_millis(1))
                .unwrap();
            ready = guard;
        }
        *ready = false;
    }
}

/// Pool of registered memory shared with a set of peers.
pub struct MemoryPool {
    self_peer: Peer,
    cm: ConnectionManager,
    is_shared: bool,

    memory: Option<PinnedMemory>,
    slabs: Option<SlabResource>,
    conn_info: HashMap<u16, ConnInfo>,

    shared: Arc<SharedCompletions>,
    thread_ids: Mutex<HashMap<std::thread::ThreadId, usize>>,
    next_thread_id: Mutex<usize>,
    worker: Mutex<Option<JoinHandle<()>>>,

    rdma_per_read: Mutex<Summary<u64>>,
}

impl MemoryPool {
    /// Wrap a connection manager for `self_peer`. `is_shared` opts into
    /// the shared completion worker started by [`MemoryPool::init`].
    pub fn new(self_peer: Peer, cm: ConnectionManager, is_shared: bool) -> Self {
        Self {
            self_peer,
            cm,
            is_shared,
            memory: None,
            slabs: None,
            conn_info: HashMap::new(),
            shared: Arc::new(SharedCompletions::new()),
            thread_ids: Mutex::new(HashMap::new()),
            next_thread_id: Mutex::new(0),
            worker: Mutex::new(None),
            rdma_per_read: Mutex::new(Summary::new("rdma_per_read", "ops", 10_000)),
        }
    }

    /// Start the manager, pin and register the arena, connect to every
    /// peer, and exchange arena advertisements.
    pub fn init(&mut self, capacity: usize, peers: &[Peer]) -> Result<()> {
        self.cm
            .start(&self.self_peer.address, Some(self.self_peer.port))?;

        // One extra word for atomic staging.
        let arena_len = capacity + std::mem::size_of::<u64>();
        let memory = PinnedMemory::new(arena_len, self.cm.pd()?)?;
        let slabs = SlabResource::new(memory.addr(), arena_len);

        for p in peers {
            loop {
                match self.cm.connect(p.id, &p.address, p.port) {
                    Ok(_) => break,
                    Err(e) if e.is_unavailable() => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let advert = RemoteObject {
            rkey: memory.rkey(),
            raddr: memory.addr() as u64,
        };
        for p in peers {
            let conn = self.cm.get_connection(p.id)?;
            conn.channel().send(&advert)?;
        }

        for p in peers {
            let conn = self.cm.get_connection(p.id)?;
            let got: RemoteObject = loop {
                match conn.channel().try_deliver() {
                    Ok(msg) => break msg,
                    Err(e) if e.is_unavailable() => continue,
                    Err(e) => return Err(e),
                }
            };
            self.conn_info.insert(
                p.id,
                ConnInfo {
                    conn,
                    rkey: got.rkey,
                    lkey: memory.lkey(),
                },
            );
        }

        self.memory = Some(memory);
        self.slabs = Some(slabs);

        if self.is_shared {
            self.spawn_worker();
        }
        Ok(())
    }

    /// The manager this pool connects through.
    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.cm
    }

    /// Connection info for a peer id.
    pub fn conn_info(&self, id: u16) -> Result<ConnInfo> {
        self.conn_info
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no connection info for node {}", id)))
    }

    /// Chunk counts observed per read, rendered for reporting.
    pub fn rdma_per_read_string(&self) -> String {
        let mut summary = self.rdma_per_read.lock().unwrap();
        summary.flush();
        summary.to_string()
    }

    fn slabs(&self) -> &SlabResource {
        self.slabs.as_ref().expect("memory pool not initialized")
    }

    fn memory(&self) -> &PinnedMemory {
        self.memory.as_ref().expect("memory pool not initialized")
    }

    /// A remote pointer naming `ptr` in this node's arena.
    pub fn remote_ptr_to<T>(&self, ptr: *const T) -> RemotePtr<T> {
        RemotePtr::new(self.self_peer.id, ptr as u64)
    }

    /// The arena's base as a remote pointer.
    pub fn base_address<T>(&self) -> RemotePtr<T> {
        self.remote_ptr_to(self.memory().addr() as *const T)
    }

    /// Slab-allocate room for `n` values of `T`, 64-byte aligned.
    pub fn allocate<T>(&self, n: usize) -> RemotePtr<T> {
        let ptr = self.slabs().allocate_t::<T>(n);
        if ptr.is_null() {
            return RemotePtr::null();
        }
        RemotePtr::new(self.self_peer.id, ptr as u64)
    }

    /// Return an allocation to its free list. Remote frees are
    /// unsupported.
    pub fn deallocate<T>(&self, p: RemotePtr<T>, n: usize) {
        assert_eq!(
            p.id(),
            self.self_peer.id,
            "deallocation of remote memory is unsupported"
        );
        self.slabs().deallocate_t(p.address() as *mut T, n);
    }

    /// Read `T` from `ptr` into `prealloc` (or a fresh allocation),
    /// returning the local destination.
    pub fn read<T>(
        &self,
        ptr: RemotePtr<T>,
        prealloc: Option<RemotePtr<T>>,
        kill: Option<&AtomicBool>,
    ) -> Result<RemotePtr<T>> {
        let local = prealloc.unwrap_or_else(|| self.allocate::<T>(1));
        self.read_internal(ptr, 0, std::mem::size_of::<T>(), std::mem::size_of::<T>(), local, kill)?;
        Ok(local)
    }

    /// Read an array of `n` values of `T` starting at `ptr`.
    pub fn extended_read<T>(
        &self,
        ptr: RemotePtr<T>,
        n: usize,
        prealloc: Option<RemotePtr<T>>,
        kill: Option<&AtomicBool>,
    ) -> Result<RemotePtr<T>> {
        let local = prealloc.unwrap_or_else(|| self.allocate::<T>(n));
        let bytes = std::mem::size_of::<T>() * n;
        self.read_internal(ptr, 0, bytes, std::mem::size_of::<T>(), local, kill)?;
        Ok(local)
    }

    /// Read an arbitrary `bytes`-long span of the object at `ptr`,
    /// starting `offset` bytes in.
    pub fn partial_read<T>(
        &self,
        ptr: RemotePtr<T>,
        offset: usize,
        bytes: usize,
        prealloc: Option<RemotePtr<T>>,
    ) -> Result<RemotePtr<T>> {
        let local = prealloc.unwrap_or_else(|| self.allocate::<T>(1));
        self.read_internal(ptr, offset, bytes, bytes, local, None)?;
        Ok(local)
    }

    fn read_internal<T>(
        &self,
        ptr: RemotePtr<T>,
        offset: usize,
        bytes: usize,
        chunk: usize,
        prealloc: RemotePtr<T>,
        kill: Option<&AtomicBool>,
    ) -> Result<()> {
        let info = self.conn_info(ptr.id())?;
        let num_chunks = bytes.div_ceil(chunk);
        let remainder = bytes % chunk;

        let local = prealloc.address();
        let mut sges = vec![unsafe { std::mem::zeroed::<ibv_sge>() }; num_chunks];
        let mut wrs = vec![unsafe { std::mem::zeroed::<ibv_send_wr>() }; num_chunks];
        for i in 0..num_chunks {
            let chunk_offset = offset + i * chunk;
            sges[i].addr = local + chunk_offset as u64;
            sges[i].length = if remainder != 0 && i == num_chunks - 1 {
                remainder as u32
            } else {
                chunk as u32
            };
            sges[i].lkey = info.lkey;

            wrs[i].wr_id = self.wr_id_for(ptr.address());
            wrs[i].num_sge = 1;
            wrs[i].sg_list = &mut sges[i];
            wrs[i].opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            wrs[i].send_flags = ibv_send_flags::IBV_SEND_FENCE.0;
            if i == num_chunks - 1 {
                wrs[i].send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
            }
            wrs[i].wr.rdma = rdma_t {
                remote_addr: ptr.address() + chunk_offset as u64,
                rkey: info.rkey,
            };
            if i > 0 {
                wrs[i - 1].next = &mut wrs[i];
            }
        }

        self.post(&info, wrs.as_mut_ptr())?;
        self.await_completion(&info, kill, ptr.address());

        self.rdma_per_read.lock().unwrap().push(num_chunks as u64);
        Ok(())
    }

    /// Write `val` to `ptr`. Without a preallocated staging slot one is
    /// allocated and freed around the call.
    pub fn write<T>(
        &self,
        ptr: RemotePtr<T>,
        val: T,
        prealloc: Option<RemotePtr<T>>,
        policy: WritePolicy,
    ) -> Result<()> {
        log::trace!("write @ {}", ptr);
        let info = self.conn_info(ptr.id())?;

        let owned = prealloc.is_none();
        let local = prealloc.unwrap_or_else(|| self.allocate::<T>(1));
        assert!(
            ptr.id() != self.self_peer.id || local.address() != ptr.address(),
            "write would stage through its own target"
        );
        unsafe {
            ptr::write(local.address() as *mut T, val);
        }

        let mut sge = ibv_sge {
            addr: local.address(),
            length: std::mem::size_of::<T>() as u32,
            lkey: info.lkey,
        };
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = self.wr_id_for(ptr.address());
        wr.num_sge = 1;
        wr.sg_list = &mut sge;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.send_flags = if policy == WritePolicy::WaitForResponse {
            ibv_send_flags::IBV_SEND_SIGNALED.0 | ibv_send_flags::IBV_SEND_FENCE.0
        } else {
            ibv_send_flags::IBV_SEND_FENCE.0
        };
        wr.wr.rdma = rdma_t {
            remote_addr: ptr.address(),
            rkey: info.rkey,
        };

        self.post(&info, &mut wr)?;
        if policy == WritePolicy::WaitForResponse {
            self.await_completion(&info, None, ptr.address());
        }

        if owned {
            self.deallocate(local, 1);
        }
        Ok(())
    }

    /// Unconditionally install `swap` at `ptr`, retrying compare-and-swap
    /// with the previously observed value until it lands. Returns the
    /// swapped-out value. `hint` primes the first compare.
    pub fn atomic_swap<T>(&self, ptr: RemotePtr<T>, swap: u64, hint: u64) -> Result<u64> {
        assert_eq!(std::mem::size_of::<T>(), 8, "remote atomics are 8-byte");
        let info = self.conn_info(ptr.id())?;
        let prev = self.allocate::<u64>(1);

        let mut expected = hint;
        loop {
            let observed = self.post_cmp_and_swp(&info, ptr.address(), prev, expected, swap)?;
            if observed == expected {
                self.deallocate(prev, 1);
                return Ok(observed);
            }
            expected = observed;
        }
    }

    /// One-shot 8-byte compare-and-swap. Returns the value previously at
    /// `ptr`; the swap landed iff it equals `expected`.
    pub fn compare_and_swap<T>(
        &self,
        ptr: RemotePtr<T>,
        expected: u64,
        swap: u64,
    ) -> Result<u64> {
        assert_eq!(std::mem::size_of::<T>(), 8, "remote atomics are 8-byte");
        let info = self.conn_info(ptr.id())?;
        let prev = self.allocate::<u64>(1);
        let observed = self.post_cmp_and_swp(&info, ptr.address(), prev, expected, swap)?;
        log::trace!(
            "compare-and-swap: expected={:x}, swap={:x}, actual={:x} (node {})",
            expected,
            swap,
            observed,
            self.self_peer.id
        );
        self.deallocate(prev, 1);
        Ok(observed)
    }

    fn post_cmp_and_swp(
        &self,
        info: &ConnInfo,
        remote_addr: u64,
        prev: RemotePtr<u64>,
        compare: u64,
        swap: u64,
    ) -> Result<u64> {
        let mut sge = ibv_sge {
            addr: prev.address(),
            length: std::mem::size_of::<u64>() as u32,
            lkey: info.lkey,
        };
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = self.wr_id_for(remote_addr);
        wr.num_sge = 1;
        wr.sg_list = &mut sge;
        wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0 | ibv_send_flags::IBV_SEND_FENCE.0;
        wr.wr.atomic = atomic_t {
            remote_addr,
            compare_add: compare,
            swap,
            rkey: info.rkey,
        };

        self.post(info, &mut wr)?;
        self.await_completion(info, None, remote_addr);
        Ok(unsafe { ptr::read_volatile(prev.address() as *const u64) })
    }

    /// Post a pre-built doorbell batch and wait for its single signaled
    /// completion.
    pub fn execute(&self, batch: &mut DoorbellBatch) -> Result<()> {
        assert!(batch.built, "doorbell batch must be built before execution");
        if self.is_shared {
            if let Some(tid) = self.registered_thread_id() {
                batch.wrs[batch.size - 1].wr_id = tid as u64;
            }
        }
        let info = batch.conn.clone();
        let kill = batch.kill.clone();
        self.post(&info, batch.wrs.as_mut_ptr())?;
        self.await_completion(&info, kill.as_deref(), 0);
        Ok(())
    }

    fn post(&self, info: &ConnInfo, head: *mut ibv_send_wr) -> Result<()> {
        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_send(info.conn.id().qp(), head, &mut bad) };
        crate::utils::from_c_ret_ctx(ret, "ibv_post_send").map_err(Error::from)
    }

    fn wr_id_for(&self, remote_addr: u64) -> u64 {
        if self.is_shared {
            self.registered_thread_id()
                .expect("operations on a shared pool require register_thread()") as u64
        } else {
            remote_addr
        }
    }

    /// Wait for exactly one completion for this operation. A completion
    /// with a non-success status aborts: the QP state is unrecoverable.
    fn await_completion(&self, info: &ConnInfo, kill: Option<&AtomicBool>, diag_addr: u64) {
        if self.is_shared {
            let tid = self
                .registered_thread_id()
                .expect("operations on a shared pool require register_thread()");
            self.shared.wait(tid, kill);
            return;
        }

        let cq = info.conn.id().send_cq();
        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        loop {
            let polled = unsafe { ibv_poll_cq(cq, 1, &mut wc) };
            if polled == 1 {
                break;
            }
            if polled < 0 && crate::utils::errno() != libc::EAGAIN {
                panic!("ibv_poll_cq(): {}", std::io::Error::last_os_error());
            }
            if let Some(kill) = kill {
                if kill.load(Ordering::Acquire) {
                    return;
                }
            }
            std::hint::spin_loop();
        }
        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            log::error!(
                "work completion failed: status {} (dest={})",
                wc.status,
                RemotePtr::<u8>::from_raw(diag_addr)
            );
            panic!("work completion failed: status {}", wc.status);
        }
    }

    /// Reserve a completion mailbox for the calling thread. Required
    /// before issuing operations on a shared-mode pool; re-registration
    /// and overflow beyond [`THREAD_MAX`] are fatal.
    pub fn register_thread(&self) {
        let thread = std::thread::current().id();
        let mut ids = self.thread_ids.lock().unwrap();
        assert!(
            !ids.contains_key(&thread),
            "thread registered with the pool twice"
        );
        let mut next = self.next_thread_id.lock().unwrap();
        assert!(*next < THREAD_MAX, "too many registered threads");
        ids.insert(thread, *next);
        *next += 1;
    }

    fn registered_thread_id(&self) -> Option<usize> {
        self.thread_ids
            .lock()
            .unwrap()
            .get(&std::thread::current().id())
            .copied()
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let conns: Vec<Arc<Connection>> =
            self.conn_info.values().map(|ci| Arc::clone(&ci.conn)).collect();
        let handle = std::thread::Builder::new()
            .name("remex-cq-worker".into())
            .spawn(move || worker_loop(shared, conns))
            .expect("failed to spawn completion worker");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stop the shared completion worker and release every waiting
    /// mailbox. No operations may be issued afterwards.
    pub fn kill_worker_thread(&self) {
        self.shared.run.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.release_all();
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if self.is_shared {
            self.kill_worker_thread();
        }
    }
}

/// Round-robin over every send CQ, routing completions to mailboxes by
/// the thread id carried in `wr_id`.
fn worker_loop(shared: Arc<SharedCompletions>, conns: Vec<Arc<Connection>>) {
    let mut wcs = vec![unsafe { std::mem::zeroed::<ibv_wc>() }; THREAD_MAX];
    while shared.run.load(Ordering::Acquire) {
        for conn in &conns {
            let polled =
                unsafe { ibv_poll_cq(conn.id().send_cq(), THREAD_MAX as i32, wcs.as_mut_ptr()) };
            if polled < 0 {
                if crate::utils::errno() == libc::EAGAIN {
                    continue;
                }
                panic!("ibv_poll_cq(): {}", std::io::Error::last_os_error());
            }
            for wc in &wcs[..polled as usize] {
                if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
                    log::error!("work completion failed: status {}", wc.status);
                    panic!("work completion failed: status {}", wc.status);
                }
                let tid = wc.wr_id as usize;
                if tid < THREAD_MAX {
                    shared.signal(tid);
                } else {
                    log::warn!("completion for unregistered wr_id {}", wc.wr_id);
                }
            }
        }
        std::hint::spin_loop();
    }
}

/// A frozen chain of work requests posted through one doorbell.
pub struct DoorbellBatch {
    conn: ConnInfo,
    wrs: Box<[ibv_send_wr]>,
    sges: Box<[ibv_sge]>,
    size: usize,
    capacity: usize,
    kill: Option<Arc<AtomicBool>>,
    built: bool,
}

unsafe impl Send for DoorbellBatch {}

impl DoorbellBatch {
    fn new(conn: ConnInfo, capacity: usize) -> Self {
        assert!(capacity > 0, "empty batches are useless");
        Self {
            conn,
            wrs: vec![unsafe { std::mem::zeroed::<ibv_send_wr>() }; capacity].into_boxed_slice(),
            sges: vec![unsafe { std::mem::zeroed::<ibv_sge>() }; capacity].into_boxed_slice(),
            size: 0,
            capacity,
            kill: None,
            built: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_mortal(&self) -> bool {
        self.kill.is_some()
    }

    /// Claim the next WR/SGE pair. `None` when the batch is full.
    fn add(&mut self) -> Option<usize> {
        if self.size == self.capacity {
            return None;
        }
        let i = self.size;
        self.size += 1;
        Some(i)
    }
}

/// Builder that fills a [`DoorbellBatch`] with reads and writes against
/// one peer.
pub struct DoorbellBatchBuilder<'a> {
    pool: &'a MemoryPool,
    batch: DoorbellBatch,
}

impl<'a> DoorbellBatchBuilder<'a> {
    /// A builder for `num_ops` work requests against `peer_id`.
    pub fn new(pool: &'a MemoryPool, peer_id: u16, num_ops: usize) -> Result<Self> {
        let conn = pool.conn_info(peer_id)?;
        Ok(Self {
            pool,
            batch: DoorbellBatch::new(conn, num_ops),
        })
    }

    fn add_read_internal<T>(
        &mut self,
        rptr: RemotePtr<T>,
        offset: usize,
        bytes: usize,
        chunk: usize,
        fence: bool,
        local: RemotePtr<T>,
    ) -> Result<()> {
        let num_chunks = bytes.div_ceil(chunk);
        let remainder = bytes % chunk;
        for i in 0..num_chunks {
            let slot = self
                .batch
                .add()
                .ok_or_else(|| Error::ResourceExhausted("doorbell batch is full".into()))?;
            let chunk_offset = offset + i * chunk;
            self.batch.sges[slot] = ibv_sge {
                addr: local.address() + chunk_offset as u64,
                length: if remainder != 0 && i == num_chunks - 1 {
                    remainder as u32
                } else {
                    chunk as u32
                },
                lkey: self.batch.conn.lkey,
            };
            let wr = &mut self.batch.wrs[slot];
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            if fence {
                wr.send_flags |= ibv_send_flags::IBV_SEND_FENCE.0;
            }
            wr.wr.rdma = rdma_t {
                remote_addr: rptr.address() + chunk_offset as u64,
                rkey: self.batch.conn.rkey,
            };
        }
        Ok(())
    }

    /// Queue a full-object read; returns the local destination.
    pub fn add_read<T>(
        &mut self,
        rptr: RemotePtr<T>,
        fence: bool,
        prealloc: Option<RemotePtr<T>>,
    ) -> Result<RemotePtr<T>> {
        let local = prealloc.unwrap_or_else(|| self.pool.allocate::<T>(1));
        let bytes = std::mem::size_of::<T>();
        self.add_read_internal(rptr, 0, bytes, bytes, fence, local)?;
        Ok(local)
    }

    /// Queue a sub-object read of `bytes` at `offset`.
    pub fn add_partial_read<T>(
        &mut self,
        rptr: RemotePtr<T>,
        offset: usize,
        bytes: usize,
        fence: bool,
        prealloc: Option<RemotePtr<T>>,
    ) -> Result<RemotePtr<T>> {
        let local = prealloc.unwrap_or_else(|| self.pool.allocate::<T>(1));
        self.add_read_internal(rptr, offset, bytes, bytes, fence, local)?;
        Ok(local)
    }

    /// Queue a write of `val` staged through a fresh allocation.
    pub fn add_write<T>(&mut self, rptr: RemotePtr<T>, val: T, fence: bool) -> Result<()> {
        let local = self.pool.allocate::<T>(1);
        unsafe {
            ptr::write(local.address() as *mut T, val);
        }
        self.add_write_prealloc(rptr, local, fence)
    }

    /// Queue a write whose payload already sits at `prealloc`.
    pub fn add_write_prealloc<T>(
        &mut self,
        rptr: RemotePtr<T>,
        prealloc: RemotePtr<T>,
        fence: bool,
    ) -> Result<()> {
        self.add_write_bytes(rptr, prealloc, std::mem::size_of::<T>(), fence)
    }

    /// Queue a raw `bytes`-long write from `prealloc`.
    pub fn add_write_bytes<T>(
        &mut self,
        rptr: RemotePtr<T>,
        prealloc: RemotePtr<T>,
        bytes: usize,
        fence: bool,
    ) -> Result<()> {
        let slot = self
            .batch
            .add()
            .ok_or_else(|| Error::ResourceExhausted("doorbell batch is full".into()))?;
        self.batch.sges[slot] = ibv_sge {
            addr: prealloc.address(),
            length: bytes as u32,
            lkey: self.batch.conn.lkey,
        };
        let wr = &mut self.batch.wrs[slot];
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        if fence {
            wr.send_flags |= ibv_send_flags::IBV_SEND_FENCE.0;
        }
        wr.wr.rdma = rdma_t {
            remote_addr: rptr.address(),
            rkey: self.batch.conn.rkey,
        };
        Ok(())
    }

    /// Let [`MemoryPool::execute`] poll `kill` and bail out early.
    pub fn add_kill_switch(&mut self, kill: Arc<AtomicBool>) {
        self.batch.kill = Some(kill);
    }

    /// Link the chain, mark the tail signaled, stamp diagnostics ids,
    /// and freeze the batch.
    pub fn build(mut self) -> DoorbellBatch {
        assert!(self.batch.size > 0, "cannot build an empty batch");
        assert_eq!(self.batch.size, self.batch.capacity, "batch must be full");
        let n = self.batch.size;
        for i in 0..n {
            self.batch.wrs[i].num_sge = 1;
            self.batch.wrs[i].sg_list = &mut self.batch.sges[i];
            self.batch.wrs[i].wr_id = unsafe { self.batch.wrs[i].wr.rdma.remote_addr };
            self.batch.wrs[i].next = if i + 1 < n {
                &mut self.batch.wrs[i + 1]
            } else {
                ptr::null_mut()
            };
        }
        self.batch.wrs[n - 1].send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        self.batch.built = true;
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_policy_defaults_to_waiting() {
        assert_eq!(WritePolicy::default(), WritePolicy::WaitForResponse);
    }

    #[test]
    fn peer_construction() {
        let p = Peer::new(3, "10.0.0.3", 18018);
        assert_eq!(p.id, 3);
        assert_eq!(p.address, "10.0.0.3");
        assert_eq!(p.port, 18018);
    }

    #[test]
    fn remote_object_serializes_compactly() {
        let advert = RemoteObject { rkey: 7, raddr: 0x1000 };
        let bytes = serde_json::to_vec(&advert).unwrap();
        // Must fit a channel slot alongside its header.
        assert!(bytes.len() < 64);
        let back: RemoteObject = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.rkey, 7);
        assert_eq!(back.raddr, 0x1000);
    }

    #[test]
    fn mailboxes_wake_waiters() {
        let shared = Arc::new(SharedCompletions::new());
        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.wait(3, None))
        };
        std::thread::sleep(Duration::from_millis(10));
        shared.signal(3);
        waiter.join().unwrap();

        // The flag is consumed by the waiter.
        assert!(!*shared.boxes[3].ready.lock().unwrap());
    }

    #[test]
    fn killed_waiters_return() {
        let shared = Arc::new(SharedCompletions::new());
        let kill = Arc::new(AtomicBool::new(false));
        let waiter = {
            let shared = Arc::clone(&shared);
            let kill = Arc::clone(&kill);
            std::thread::spawn(move || shared.wait(0, Some(&kill)))
        };
        std::thread::sleep(Duration::from_millis(10));
        kill.store(true, Ordering::Release);
        waiter.join().unwrap();
    }
}
