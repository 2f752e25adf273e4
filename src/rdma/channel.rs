//! Two-sided message exchange over one-sided writes.
//!
//! Each endpoint owns one pinned region split into a send ring and a
//! receive ring of equal-sized slots, plus two credit words. A send
//! copies the serialized payload into the next outbound slot and issues
//! two chained RDMA WRITEs into the peer's receive ring: payload first,
//! then the slot header. Writes are ordered within a QP, so the receiver
//! never observes a valid header over a half-written payload. No receive
//! work requests are ever posted; the recv CQ stays unused.
//!
//! Flow control is a credit rule: once the receiver has consumed half
//! its ring it writes its read cursor into the sender's credit word, and
//! the sender refuses to overwrite unread slots in the meantime.

use std::ptr;
use std::sync::{Mutex, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use rdma_sys::*;

use crate::error::{Error, Result};
use crate::rdma::device::Pd;
use crate::rdma::memory::PinnedMemory;
use crate::rdma::types::CmId;

/// Default per-direction ring capacity in bytes.
pub const DEFAULT_RING_CAPACITY: usize = 1 << 12;
/// Default slot size in bytes.
pub const DEFAULT_SLOT_SIZE: usize = 1 << 8;

const MIN_RING_CAPACITY: usize = 1 << 12;
const MIN_SLOT_SIZE: usize = 64;

/// Slot header: bit 63 marks the slot valid, the low 32 bits carry the
/// payload length.
const HEADER_BYTES: usize = 8;
const HEADER_VALID: u64 = 1 << 63;
const HEADER_LEN_MASK: u64 = 0xffff_ffff;

/// What a receiver advertises about its receive ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingInfo {
    /// Base of the receive ring on the advertising node.
    pub ring_addr: u64,
    /// Address of the advertiser's credit-in word.
    pub credit_addr: u64,
    /// rkey covering both.
    pub rkey: u32,
    /// Ring capacity in bytes.
    pub capacity: u32,
    /// Slot size in bytes.
    pub slot_size: u32,
}

impl RingInfo {
    pub(crate) const WIRE_BYTES: usize = 28;

    pub(crate) fn to_bytes(&self) -> [u8; Self::WIRE_BYTES] {
        let mut out = [0u8; Self::WIRE_BYTES];
        out[0..8].copy_from_slice(&self.ring_addr.to_le_bytes());
        out[8..16].copy_from_slice(&self.credit_addr.to_le_bytes());
        out[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        out[20..24].copy_from_slice(&self.capacity.to_le_bytes());
        out[24..28].copy_from_slice(&self.slot_size.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_BYTES {
            return None;
        }
        Some(Self {
            ring_addr: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            credit_addr: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            rkey: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            capacity: u32::from_le_bytes(buf[20..24].try_into().ok()?),
            slot_size: u32::from_le_bytes(buf[24..28].try_into().ok()?),
        })
    }
}

/// Slot-granular cursor bookkeeping for one ring direction.
///
/// Cursors are virtual (monotonically increasing) slot counts; the slot
/// index is the cursor modulo the slot count. The sender's view of the
/// peer's read cursor only ever moves forward, no matter how stale the
/// credit word it refreshes from is.
#[derive(Debug)]
struct RingCursors {
    nslots: u64,
    cursor: u64,
    /// Sender: last read cursor seen from the peer. Receiver: slots
    /// consumed since the last credit write.
    mark: u64,
}

impl RingCursors {
    fn new(nslots: u64) -> Self {
        debug_assert!(nslots > 0);
        Self { nslots, cursor: 0, mark: 0 }
    }

    #[inline]
    fn slot_index(&self) -> u64 {
        self.cursor % self.nslots
    }

    /// Sender: whether the next slot may be written.
    #[inline]
    fn may_send(&self) -> bool {
        self.cursor - self.mark < self.nslots
    }

    /// Sender: fold in a credit value read from the credit word.
    #[inline]
    fn refresh_credit(&mut self, credit: u64) {
        if credit > self.mark {
            self.mark = credit;
        }
    }

    /// Receiver: account one consumed slot; returns `true` when a credit
    /// update is due (half the ring consumed since the last one).
    #[inline]
    fn consume(&mut self) -> bool {
        self.cursor += 1;
        self.mark += 1;
        if self.mark >= self.nslots / 2 {
            self.mark = 0;
            true
        } else {
            false
        }
    }
}

/// Bidirectional ring-buffered message channel bound to one connection.
pub struct Channel {
    id: CmId,
    mem: PinnedMemory,
    capacity: usize,
    slot_size: usize,
    send: Mutex<RingCursors>,
    recv: Mutex<RingCursors>,
    peer: OnceLock<RingInfo>,
}

impl Channel {
    /// Build a channel over `id` with the default geometry.
    pub fn new(id: CmId, pd: Pd) -> Result<Self> {
        Self::with_geometry(id, pd, DEFAULT_RING_CAPACITY, DEFAULT_SLOT_SIZE)
    }

    /// Build a channel with an explicit per-direction ring capacity and
    /// slot size. The capacity must be a multiple of the slot size.
    pub fn with_geometry(id: CmId, pd: Pd, capacity: usize, slot_size: usize) -> Result<Self> {
        if capacity < MIN_RING_CAPACITY
            || slot_size < MIN_SLOT_SIZE
            || capacity % slot_size != 0
        {
            return Err(Error::FailedPrecondition(format!(
                "bad channel geometry: capacity={}, slot={}",
                capacity, slot_size
            )));
        }

        // [send ring | recv ring | credit-in | credit-out]
        let mem = PinnedMemory::new(2 * capacity + 16, pd)?;
        let nslots = (capacity / slot_size) as u64;
        Ok(Self {
            id,
            mem,
            capacity,
            slot_size,
            send: Mutex::new(RingCursors::new(nslots)),
            recv: Mutex::new(RingCursors::new(nslots)),
            peer: OnceLock::new(),
        })
    }

    /// The ring info this endpoint advertises to its peer.
    pub fn local_info(&self) -> RingInfo {
        let base = self.mem.addr() as u64;
        RingInfo {
            ring_addr: base + self.capacity as u64,
            credit_addr: base + 2 * self.capacity as u64,
            rkey: self.mem.rkey(),
            capacity: self.capacity as u32,
            slot_size: self.slot_size as u32,
        }
    }

    /// Bind the peer's advertised ring. Must happen exactly once, before
    /// the first `send` or `try_deliver`.
    pub fn bind_peer(&self, info: RingInfo) -> Result<()> {
        if info.capacity as usize != self.capacity || info.slot_size as usize != self.slot_size {
            return Err(Error::internal(format!(
                "peer ring geometry mismatch: {}x{} here, {}x{} there",
                self.capacity, self.slot_size, info.capacity, info.slot_size
            )));
        }
        self.peer
            .set(info)
            .map_err(|_| Error::internal("peer ring already bound"))
    }

    /// Largest serialized payload a single slot can carry.
    pub fn max_payload(&self) -> usize {
        self.slot_size - HEADER_BYTES
    }

    fn peer(&self) -> Result<&RingInfo> {
        self.peer
            .get()
            .ok_or_else(|| Error::unavailable("peer ring not yet advertised"))
    }

    #[inline]
    fn credit_in_ptr(&self) -> *mut u64 {
        unsafe { self.mem.addr().add(2 * self.capacity) as *mut u64 }
    }

    #[inline]
    fn credit_out_ptr(&self) -> *mut u64 {
        unsafe { self.mem.addr().add(2 * self.capacity + 8) as *mut u64 }
    }

    /// Serialize `msg` into the next outbound slot and push it to the
    /// peer. `ResourceExhausted` when the payload cannot fit a slot or
    /// every slot is unread.
    pub fn send<M: Serialize>(&self, msg: &M) -> Result<()> {
        let peer = *self.peer()?;
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > self.max_payload() {
            return Err(Error::ResourceExhausted(format!(
                "payload of {} bytes exceeds slot capacity {}",
                payload.len(),
                self.max_payload()
            )));
        }

        let mut send = self.send.lock().unwrap();
        send.refresh_credit(unsafe { ptr::read_volatile(self.credit_in_ptr()) });
        if !send.may_send() {
            return Err(Error::ResourceExhausted("send ring full".into()));
        }

        let slot_off = (send.slot_index() as usize) * self.slot_size;
        let staging = unsafe { self.mem.addr().add(slot_off) };
        let header = HEADER_VALID | payload.len() as u64;
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), staging.add(HEADER_BYTES), payload.len());
            ptr::write_volatile(staging as *mut u64, header);
        }

        let remote_slot = peer.ring_addr + slot_off as u64;

        // Payload first, header second; the header WR is the only
        // signaled one and commits the message.
        let mut sge = [
            ibv_sge {
                addr: staging as u64 + HEADER_BYTES as u64,
                length: payload.len() as u32,
                lkey: self.mem.lkey(),
            },
            ibv_sge {
                addr: staging as u64,
                length: HEADER_BYTES as u32,
                lkey: self.mem.lkey(),
            },
        ];
        let mut wrs = [unsafe { std::mem::zeroed::<ibv_send_wr>() }; 2];
        wrs[0].num_sge = 1;
        wrs[0].sg_list = &mut sge[0];
        wrs[0].opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wrs[0].wr.rdma = rdma_t {
            remote_addr: remote_slot + HEADER_BYTES as u64,
            rkey: peer.rkey,
        };
        wrs[1].num_sge = 1;
        wrs[1].sg_list = &mut sge[1];
        wrs[1].opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wrs[1].send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wrs[1].wr.rdma = rdma_t {
            remote_addr: remote_slot,
            rkey: peer.rkey,
        };
        wrs[0].next = &mut wrs[1];

        // Empty payloads still commit through the header write alone.
        let head = if payload.is_empty() { &mut wrs[1] } else { &mut wrs[0] };
        self.post_and_poll(head)?;
        send.cursor += 1;
        Ok(())
    }

    /// Deliver the next pending message, if any. `Unavailable` when no
    /// slot is ready.
    pub fn try_deliver<M: DeserializeOwned>(&self) -> Result<M> {
        let peer = *self.peer()?;
        let mut recv = self.recv.lock().unwrap();

        let slot_off = self.capacity + (recv.slot_index() as usize) * self.slot_size;
        let slot = unsafe { self.mem.addr().add(slot_off) };
        let header = unsafe { ptr::read_volatile(slot as *const u64) };
        if header & HEADER_VALID == 0 {
            return Err(Error::unavailable("no message ready"));
        }

        let len = (header & HEADER_LEN_MASK) as usize;
        if len > self.max_payload() {
            return Err(Error::internal(format!(
                "corrupt slot header: length {}",
                len
            )));
        }

        let mut payload = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(slot.add(HEADER_BYTES), payload.as_mut_ptr(), len);
            ptr::write_volatile(slot as *mut u64, 0);
        }

        if recv.consume() {
            self.write_credit(&peer, recv.cursor)?;
        }
        drop(recv);

        Ok(serde_json::from_slice(&payload)?)
    }

    /// Push our read cursor into the sender's credit word.
    fn write_credit(&self, peer: &RingInfo, cursor: u64) -> Result<()> {
        unsafe { ptr::write_volatile(self.credit_out_ptr(), cursor) };

        let mut sge = ibv_sge {
            addr: self.credit_out_ptr() as u64,
            length: 8,
            lkey: self.mem.lkey(),
        };
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.num_sge = 1;
        wr.sg_list = &mut sge;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr.rdma = rdma_t {
            remote_addr: peer.credit_addr,
            rkey: peer.rkey,
        };
        self.post_and_poll(&mut wr)
    }

    /// Post a WR chain and consume its single completion. A non-success
    /// completion is fatal: the QP is unusable afterwards.
    fn post_and_poll(&self, head: &mut ibv_send_wr) -> Result<()> {
        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.id.qp(), head, &mut bad_wr) };
        crate::utils::from_c_ret_ctx(ret, "ibv_post_send").map_err(Error::from)?;

        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        loop {
            let polled = unsafe { ibv_poll_cq(self.id.send_cq(), 1, &mut wc) };
            if polled == 1 {
                break;
            }
            if polled < 0 && crate::utils::errno() != libc::EAGAIN {
                panic!(
                    "ibv_poll_cq(): {} on channel send CQ",
                    std::io::Error::last_os_error()
                );
            }
            std::hint::spin_loop();
        }
        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            log::error!("channel work completion failed with status {}", wc.status);
            panic!("channel work completion failed: status {}", wc.status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_info_round_trips_over_the_wire() {
        let info = RingInfo {
            ring_addr: 0xdead_beef_0000,
            credit_addr: 0xdead_beef_2000,
            rkey: 0x1234,
            capacity: 4096,
            slot_size: 64,
        };
        assert_eq!(RingInfo::from_bytes(&info.to_bytes()), Some(info));
        assert_eq!(RingInfo::from_bytes(&[0u8; 8]), None);
    }

    #[test]
    fn sender_blocks_at_a_full_ring() {
        // Slot capacity 64 in a 4096-byte ring: 64 slots.
        let mut tx = RingCursors::new(4096 / 64);
        for _ in 0..64 {
            assert!(tx.may_send());
            tx.cursor += 1;
        }
        assert!(!tx.may_send());

        // One consumed slot reported through the credit word frees one.
        tx.refresh_credit(1);
        assert!(tx.may_send());
        tx.cursor += 1;
        assert!(!tx.may_send());
    }

    #[test]
    fn stale_credit_never_rewinds() {
        let mut tx = RingCursors::new(16);
        tx.refresh_credit(8);
        assert_eq!(tx.mark, 8);
        tx.refresh_credit(3);
        assert_eq!(tx.mark, 8);
    }

    #[test]
    fn receiver_credits_after_half_ring() {
        let mut rx = RingCursors::new(64);
        let mut credits = 0;
        for i in 0..256 {
            if rx.consume() {
                credits += 1;
                // Credit fires every nslots/2 = 32 consumed slots.
                assert_eq!((i + 1) % 32, 0);
            }
        }
        assert_eq!(credits, 8);
        assert_eq!(rx.cursor, 256);
    }

    #[test]
    fn slot_indices_wrap() {
        let mut rx = RingCursors::new(4);
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(rx.slot_index());
            rx.cursor += 1;
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
