//! Deadlock-free, symmetric connection management over `rdma_cm`.
//!
//! Every node runs one [`ConnectionManager`]. Outgoing dials and
//! incoming requests both funnel through a single arbitration word so
//! that two nodes dialling each other simultaneously resolve the race
//! deterministically: the node holding its own dial rejects the incoming
//! request, the peer's reject bounces the loser's dial, and exactly one
//! established connection per pair survives. Connecting to one's own id
//! takes a loopback path that drives the QP to RTS by hand instead of
//! negotiating through `rdma_cm`.

use std::collections::HashMap;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdma_sys::*;

use crate::error::{Error, Result};
use crate::rdma::broker::{set_nonblocking, Broker, Receiver};
use crate::rdma::channel::{Channel, RingInfo};
use crate::rdma::connection::Connection;
use crate::rdma::device::Pd;
use crate::rdma::types::{CmEvent, CmId, EventChannel};
use crate::utils::{errno, from_c_ret_ctx, sockaddr_in};

/// Physical port used when self-looping a QP.
pub const LOOPBACK_PORT_NUM: u8 = 1;

/// Per-connection message-ring capacity in bytes.
const RING_CAPACITY: usize = 1 << 12;
/// Largest receive unit used to size the work-request queues.
const MAX_RECV_BYTES: usize = 64;
const MAX_WR: u32 = (RING_CAPACITY / MAX_RECV_BYTES) as u32;
const MAX_SGE: u32 = 1;
const MAX_INLINE_DATA: u32 = 0;

const UNLOCKED: i64 = -1;

const MIN_BACKOFF_US: u64 = 100;
const MAX_BACKOFF_US: u64 = 5_000_000;

/// Arbitration word: `-1` when free, otherwise the id of the peer whose
/// connection attempt currently holds it.
struct DialLock {
    mu: AtomicI64,
    my_id: i64,
}

impl DialLock {
    fn new(my_id: u16) -> Self {
        Self {
            mu: AtomicI64::new(UNLOCKED),
            my_id: my_id as i64,
        }
    }

    /// Spin until the word is free and install `holder`, or give up as
    /// soon as the current holder is our own id (a concurrent outgoing
    /// dial from this node).
    fn acquire(&self, holder: u16) -> bool {
        loop {
            match self
                .mu
                .compare_exchange_weak(UNLOCKED, holder as i64, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => {
                    if actual == self.my_id {
                        log::debug!(
                            "(node {}) giving up lock acquisition: actual={}, swap={}",
                            self.my_id,
                            actual,
                            holder
                        );
                        return false;
                    }
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Like [`DialLock::acquire`], but yields until it succeeds.
    fn acquire_blocking(&self, holder: u16) {
        while !self.acquire(holder) {
            std::thread::yield_now();
        }
    }

    fn release(&self) {
        self.mu.store(UNLOCKED, Ordering::Release);
    }
}

struct Inner {
    my_id: u16,
    accepting: AtomicBool,
    lock: DialLock,
    backoff_us: AtomicU64,
    established: Mutex<HashMap<u16, Arc<Connection>>>,
    broker: Mutex<Option<Broker>>,
}

/// Connection manager: at most one established connection per peer id.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(my_id: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                my_id,
                accepting: AtomicBool::new(false),
                lock: DialLock::new(my_id),
                backoff_us: AtomicU64::new(0),
                established: Mutex::new(HashMap::new()),
                broker: Mutex::new(None),
            }),
        }
    }

    /// Bind the broker and begin accepting requests. Starting twice is
    /// an error.
    pub fn start(&self, addr: &str, port: Option<u16>) -> Result<()> {
        if self.inner.accepting.swap(true, Ordering::AcqRel) {
            return Err(Error::internal("cannot start broker twice"));
        }
        let broker = Broker::bind(addr, port, Arc::<Inner>::clone(&self.inner) as Arc<dyn Receiver>)?;
        *self.inner.broker.lock().unwrap() = Some(broker);
        Ok(())
    }

    /// The id this manager answers as.
    pub fn my_id(&self) -> u16 {
        self.inner.my_id
    }

    /// Bound broker address.
    pub fn address(&self) -> Result<Ipv4Addr> {
        self.with_broker(|b| b.address())
    }

    /// Bound broker port.
    pub fn port(&self) -> Result<u16> {
        self.with_broker(|b| b.port())
    }

    /// The protection domain every connection shares.
    pub fn pd(&self) -> Result<Pd> {
        self.with_broker(|b| b.pd())
    }

    fn with_broker<T>(&self, f: impl FnOnce(&Broker) -> T) -> Result<T> {
        let broker = self.inner.broker.lock().unwrap();
        broker
            .as_ref()
            .map(f)
            .ok_or_else(|| Error::FailedPrecondition("connection manager not started".into()))
    }

    /// Number of established connections (loopback included).
    pub fn num_connections(&self) -> usize {
        self.inner.lock.acquire_blocking(self.inner.my_id);
        let n = self.inner.established.lock().unwrap().len();
        self.inner.lock.release();
        n
    }

    /// Return the established connection to `peer_id`, dialling
    /// `server:port` if none exists yet.
    ///
    /// `Unavailable` means the attempt lost an arbitration race (ours or
    /// the peer's) and should be retried after a moment.
    pub fn connect(&self, peer_id: u16, server: &str, port: u16) -> Result<Arc<Connection>> {
        self.inner.connect(peer_id, server, port)
    }

    /// Return the established connection to `peer_id`, or `NotFound`.
    pub fn get_connection(&self, peer_id: u16) -> Result<Arc<Connection>> {
        self.inner.lock.acquire_blocking(self.inner.my_id);
        let conn = self.inner.established.lock().unwrap().get(&peer_id).cloned();
        self.inner.lock.release();
        conn.ok_or_else(|| Error::NotFound(format!("connection not found: {}", peer_id)))
    }

    /// Stop accepting new connection requests. Existing connections stay
    /// valid until the manager is dropped.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        log::debug!("(node {}) shutting down connection manager", self.inner.my_id);
        self.shutdown();
        if let Some(mut broker) = self.inner.broker.lock().unwrap().take() {
            let _ = broker.stop();
        }
        self.inner.lock.acquire_blocking(self.inner.my_id);
        self.inner.established.lock().unwrap().clear();
        self.inner.lock.release();
    }
}

impl Inner {
    fn pd(&self) -> Result<Pd> {
        let broker = self.broker.lock().unwrap();
        broker
            .as_ref()
            .map(|b| b.pd())
            .ok_or_else(|| Error::FailedPrecondition("connection manager not started".into()))
    }

    fn broker_address(&self) -> Result<Ipv4Addr> {
        let broker = self.broker.lock().unwrap();
        broker
            .as_ref()
            .map(|b| b.address())
            .ok_or_else(|| Error::FailedPrecondition("connection manager not started".into()))
    }

    fn bump_backoff(&self) -> u64 {
        let prev = self.backoff_us.load(Ordering::Relaxed);
        let next = if prev > 0 {
            ((prev + 100 * self.my_id as u64) * 2).min(MAX_BACKOFF_US)
        } else {
            MIN_BACKOFF_US
        };
        self.backoff_us.store(next, Ordering::Relaxed);
        next
    }

    fn connect(&self, peer_id: u16, server: &str, port: u16) -> Result<Arc<Connection>> {
        if !self.lock.acquire(self.my_id) {
            return Err(Error::unavailable("lock acquisition failed"));
        }

        if let Some(conn) = self.established.lock().unwrap().get(&peer_id) {
            let conn = Arc::clone(conn);
            self.lock.release();
            return Ok(conn);
        }

        match self.dial(peer_id, server, port) {
            Ok(conn) => {
                self.backoff_us.store(0, Ordering::Relaxed);
                self.lock.release();
                Ok(conn)
            }
            Err(e) => {
                self.lock.release();
                // Back off with the word released so the peer's dial can
                // land in the meantime.
                if e.is_unavailable() {
                    let backoff = self.backoff_us.load(Ordering::Relaxed);
                    if backoff > 0 {
                        std::thread::sleep(Duration::from_micros(backoff));
                    }
                }
                Err(e)
            }
        }
    }

    /// Resolve, create the endpoint, and run the client side of the
    /// handshake. Called with the arbitration lock held.
    fn dial(&self, peer_id: u16, server: &str, port: u16) -> Result<Arc<Connection>> {
        let pd = self.pd()?;

        let server_c = CString::new(server)
            .map_err(|_| Error::internal(format!("bad server address: {:?}", server)))?;
        let service_c = CString::new(port.to_string()).expect("ports render as plain digits");

        let mut hints = unsafe { std::mem::zeroed::<rdma_addrinfo>() };
        hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as i32;
        hints.ai_qp_type = ibv_qp_type::IBV_QPT_RC as i32;
        let mut src = sockaddr_in(self.broker_address()?, 0);
        hints.ai_src_addr = &mut src as *mut _ as *mut libc::sockaddr;
        hints.ai_src_len = std::mem::size_of::<libc::sockaddr_in>() as u32;

        let mut resolved: *mut rdma_addrinfo = ptr::null_mut();
        let gai = unsafe {
            rdma_getaddrinfo(
                server_c.as_ptr(),
                service_c.as_ptr(),
                &hints,
                &mut resolved,
            )
        };
        if gai != 0 {
            return Err(Error::internal(format!(
                "rdma_getaddrinfo({}:{}): {}",
                server,
                port,
                std::io::Error::last_os_error()
            )));
        }

        let mut init_attr = default_qp_init_attr();
        let mut raw_id: *mut rdma_cm_id = ptr::null_mut();
        let err = unsafe { rdma_create_ep(&mut raw_id, resolved, pd.as_raw(), &mut init_attr) };
        unsafe { rdma_freeaddrinfo(resolved) };
        if err != 0 {
            return Err(Error::internal(format!(
                "rdma_create_ep(): {}",
                std::io::Error::last_os_error()
            )));
        }
        let id = CmId::new(raw_id).expect("rdma_create_ep returned null id");
        log::debug!(
            "(node {}) trying to connect to node {} ({}:{})",
            self.my_id,
            peer_id,
            server,
            port
        );

        if peer_id == self.my_id {
            return self.connect_loopback(id, pd);
        }

        // Dial over a private event channel so the broker thread never
        // blocks on our handshake.
        let event_channel = EventChannel::new(unsafe { rdma_create_event_channel() })
            .ok_or_else(|| Error::internal("rdma_create_event_channel failed"))?;
        let fail = |e: Error| {
            unsafe {
                rdma_destroy_ep(id.as_ptr());
                rdma_destroy_event_channel(event_channel.as_ptr());
            }
            e
        };
        set_nonblocking(event_channel.fd()).map_err(&fail)?;
        unsafe {
            from_c_ret_ctx(rdma_migrate_id(id.as_ptr(), event_channel.as_ptr()), "rdma_migrate_id")
                .map_err(|e| fail(e.into()))?;
        }

        let channel = Channel::new(id, pd.clone()).map_err(&fail)?;
        let setup = setup_bytes(self.my_id, &channel.local_info());

        let mut conn_param = default_conn_param(&setup);
        unsafe {
            from_c_ret_ctx(rdma_connect(id.as_ptr(), &mut conn_param), "rdma_connect")
                .map_err(|e| fail(e.into()))?;
        }

        loop {
            let event = wait_for_event(event_channel).map_err(&fail)?;
            log::debug!(
                "(node {}) got event: {} while dialling {}",
                self.my_id,
                event.type_str(),
                peer_id
            );

            match event.event_type() {
                rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                    let peer_ring = parse_setup(event.private_data()).map(|(_, ring)| ring);
                    event.ack();

                    if let Some(existing) = self.established.lock().unwrap().get(&peer_id) {
                        // The peer's accept beat our dial; keep theirs.
                        log::debug!("(node {}) already connected: {}", self.my_id, peer_id);
                        let existing = Arc::clone(existing);
                        unsafe {
                            rdma_disconnect(id.as_ptr());
                            drain_dial_events(event_channel);
                            rdma_destroy_ep(id.as_ptr());
                            rdma_destroy_event_channel(event_channel.as_ptr());
                        }
                        return Ok(existing);
                    }

                    let ring = peer_ring.ok_or_else(|| {
                        fail(Error::internal("established event carried no ring info"))
                    })?;
                    channel.bind_peer(ring).map_err(&fail)?;

                    let conn = Arc::new(Connection::new(
                        self.my_id,
                        peer_id,
                        id,
                        channel,
                        Some(event_channel),
                    ));
                    self.established
                        .lock()
                        .unwrap()
                        .insert(peer_id, Arc::clone(&conn));
                    return Ok(conn);
                }
                rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => {
                    log::warn!("(node {}) got addr resolved mid-dial", self.my_id);
                    event.ack();
                }
                other => {
                    event.ack();
                    self.bump_backoff();
                    unsafe {
                        rdma_destroy_ep(id.as_ptr());
                        rdma_destroy_event_channel(event_channel.as_ptr());
                    }
                    if other == rdma_cm_event_type::RDMA_CM_EVENT_REJECTED {
                        return Err(Error::unavailable("connection request rejected"));
                    }
                    return Err(Error::internal(format!(
                        "unexpected event while dialling node {}",
                        peer_id
                    )));
                }
            }
        }
    }

    /// Drive the endpoint's QP through INIT → RTR → RTS against itself.
    /// Called with the arbitration lock held.
    fn connect_loopback(&self, id: CmId, pd: Pd) -> Result<Arc<Connection>> {
        debug_assert!(!id.qp().is_null(), "no QP associated with endpoint");
        log::debug!("(node {}) connecting loopback", self.my_id);

        let fail = |e: Error| {
            unsafe { rdma_destroy_ep(id.as_ptr()) };
            e
        };

        let qp_num = unsafe { (*id.qp()).qp_num };
        let mut attr = default_qp_attr();
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.port_num = LOOPBACK_PORT_NUM;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        unsafe {
            from_c_ret_ctx(ibv_modify_qp(id.qp(), &mut attr, mask.0 as i32), "ibv_modify_qp")
                .map_err(|e| fail(e.into()))?;
        }

        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        unsafe {
            from_c_ret_ctx(
                ___ibv_query_port(id.verbs(), LOOPBACK_PORT_NUM, &mut port_attr),
                "ibv_query_port",
            )
            .map_err(|e| fail(e.into()))?;
        }

        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.dest_qp_num = qp_num;
        attr.ah_attr.dlid = port_attr.lid;
        attr.ah_attr.port_num = LOOPBACK_PORT_NUM;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        unsafe {
            from_c_ret_ctx(ibv_modify_qp(id.qp(), &mut attr, mask.0 as i32), "ibv_modify_qp")
                .map_err(|e| fail(e.into()))?;
        }

        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        unsafe {
            from_c_ret_ctx(ibv_modify_qp(id.qp(), &mut attr, mask.0 as i32), "ibv_modify_qp")
                .map_err(|e| fail(e.into()))?;
        }

        let channel = Channel::new(id, pd).map_err(&fail)?;
        channel
            .bind_peer(channel.local_info())
            .map_err(&fail)?;

        let conn = Arc::new(Connection::new(self.my_id, self.my_id, id, channel, None));
        self.established
            .lock()
            .unwrap()
            .insert(self.my_id, Arc::clone(&conn));
        Ok(conn)
    }
}

impl Receiver for Inner {
    fn on_connect_request(&self, id: CmId, event: CmEvent) {
        if !self.accepting.load(Ordering::Acquire) {
            unsafe { rdma_reject(event.id(), ptr::null(), 0) };
            event.ack();
            return;
        }

        let Some((peer_id, peer_ring)) = parse_setup(event.private_data()) else {
            log::warn!(
                "(node {}) connect request without usable private data",
                self.my_id
            );
            unsafe { rdma_reject(event.id(), ptr::null(), 0) };
            event.ack();
            return;
        };
        log::debug!(
            "(node {}) got connection request from node {}",
            self.my_id,
            peer_id
        );

        if peer_id == self.my_id {
            // Loopback never negotiates through the broker.
            log::warn!("(node {}) rejecting self connect request", self.my_id);
            unsafe { rdma_reject(event.id(), ptr::null(), 0) };
            event.ack();
            return;
        }

        // Losing the arbitration here (our own dial holds the word)
        // resolves the simultaneous-connect race: the peer retries and
        // one side's dial wins.
        if !self.lock.acquire(peer_id) {
            log::debug!("(node {}) lock acquisition failed, rejecting", self.my_id);
            unsafe {
                rdma_reject(event.id(), ptr::null(), 0);
                rdma_destroy_ep(id.as_ptr());
            }
            event.ack();
            return;
        }

        let reject_and_release = |msg: &str| {
            log::debug!("(node {}) {}: {}", self.my_id, msg, peer_id);
            unsafe {
                rdma_reject(event.id(), ptr::null(), 0);
                rdma_destroy_ep(id.as_ptr());
            }
            event.ack();
            self.lock.release();
        };

        if self.established.lock().unwrap().contains_key(&peer_id) {
            reject_and_release("connection already established");
            return;
        }

        let pd = match self.pd() {
            Ok(pd) => pd,
            Err(e) => {
                log::error!("(node {}) no protection domain: {}", self.my_id, e);
                reject_and_release("broker not ready");
                return;
            }
        };

        debug_assert!(id.qp().is_null(), "QP already allocated on request id");
        let mut init_attr = default_qp_init_attr();
        let ret = unsafe { rdma_create_qp(id.as_ptr(), pd.as_raw(), &mut init_attr) };
        if ret != 0 {
            log::error!(
                "(node {}) rdma_create_qp(): {}",
                self.my_id,
                std::io::Error::last_os_error()
            );
            reject_and_release("failed to create QP");
            return;
        }

        let channel = match Channel::new(id, pd) {
            Ok(ch) => ch,
            Err(e) => {
                log::error!("(node {}) channel setup failed: {}", self.my_id, e);
                reject_and_release("failed to build channel");
                return;
            }
        };
        if let Err(e) = channel.bind_peer(peer_ring) {
            log::error!("(node {}) {}", self.my_id, e);
            reject_and_release("peer ring rejected");
            return;
        }

        let setup = setup_bytes(self.my_id, &channel.local_info());
        let mut conn_param = default_conn_param(&setup);

        let conn = Arc::new(Connection::new(self.my_id, peer_id, id, channel, None));
        self.established
            .lock()
            .unwrap()
            .insert(peer_id, Arc::clone(&conn));
        log::debug!("(node {}) accepting peer={}", self.my_id, peer_id);

        let ret = unsafe { rdma_accept(id.as_ptr(), &mut conn_param) };
        if ret != 0 {
            log::error!(
                "(node {}) rdma_accept(): {}",
                self.my_id,
                std::io::Error::last_os_error()
            );
            self.established.lock().unwrap().remove(&peer_id);
        }
        event.ack();
        self.lock.release();
    }

    fn on_established(&self, _id: CmId, event: CmEvent) {
        event.ack();
    }

    fn on_disconnect(&self, id: CmId) {
        // The peer initiated this disconnect; forget the connection so a
        // future dial can rebuild it. The endpoint itself is destroyed
        // when the last reference drops.
        let mut established = self.established.lock().unwrap();
        if let Some(peer_id) = established
            .iter()
            .find(|(_, conn)| conn.id() == id)
            .map(|(peer, _)| *peer)
        {
            log::debug!("(node {}) disconnected from node {}", self.my_id, peer_id);
            established.remove(&peer_id);
        }
    }
}

fn default_qp_init_attr() -> ibv_qp_init_attr {
    let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
    init_attr.cap.max_send_wr = MAX_WR;
    init_attr.cap.max_recv_wr = MAX_WR;
    init_attr.cap.max_send_sge = MAX_SGE;
    init_attr.cap.max_recv_sge = MAX_SGE;
    init_attr.cap.max_inline_data = MAX_INLINE_DATA;
    init_attr.sq_sig_all = 0; // Completions are requested per-WR.
    init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    init_attr
}

fn default_qp_attr() -> ibv_qp_attr {
    let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
    attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
        .0;
    attr.max_dest_rd_atomic = 8;
    attr.path_mtu = ibv_mtu::IBV_MTU_4096;
    attr.min_rnr_timer = 12;
    attr.rq_psn = 0;
    attr.sq_psn = 0;
    attr.timeout = 12;
    attr.retry_cnt = 7;
    attr.rnr_retry = 1;
    attr.max_rd_atomic = 8;
    attr
}

fn default_conn_param(private_data: &[u8]) -> rdma_conn_param {
    let mut param = unsafe { std::mem::zeroed::<rdma_conn_param>() };
    param.private_data = private_data.as_ptr() as *const libc::c_void;
    param.private_data_len = private_data.len() as u8;
    param.retry_count = 7;
    param.rnr_retry_count = 1;
    param.responder_resources = 8;
    param.initiator_depth = 8;
    param
}

/// Private data layout: 4-byte little-endian node id, then the ring
/// advertisement.
fn setup_bytes(node_id: u16, ring: &RingInfo) -> [u8; 4 + RingInfo::WIRE_BYTES] {
    let mut out = [0u8; 4 + RingInfo::WIRE_BYTES];
    out[0..4].copy_from_slice(&(node_id as u32).to_le_bytes());
    out[4..].copy_from_slice(&ring.to_bytes());
    out
}

fn parse_setup(buf: &[u8]) -> Option<(u16, RingInfo)> {
    if buf.len() < 4 + RingInfo::WIRE_BYTES {
        return None;
    }
    let node_id = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let ring = RingInfo::from_bytes(&buf[4..])?;
    Some((node_id as u16, ring))
}

/// Block (spinning over `EAGAIN`) until the dial channel yields an event.
fn wait_for_event(channel: EventChannel) -> Result<CmEvent> {
    loop {
        let mut raw: *mut rdma_cm_event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(channel.as_ptr(), &mut raw) };
        if ret == 0 {
            return Ok(CmEvent::new(raw).expect("rdma_get_cm_event returned null event"));
        }
        if errno() != libc::EAGAIN {
            return Err(Error::internal(format!(
                "rdma_get_cm_event(): {}",
                std::io::Error::last_os_error()
            )));
        }
        std::hint::spin_loop();
    }
}

/// Ack whatever the disconnect handshake produces on a dial channel.
fn drain_dial_events(channel: EventChannel) {
    let deadline = std::time::Instant::now() + Duration::from_millis(100);
    loop {
        let mut raw: *mut rdma_cm_event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(channel.as_ptr(), &mut raw) };
        if ret == 0 {
            unsafe { rdma_ack_cm_event(raw) };
            continue;
        }
        if errno() != libc::EAGAIN || std::time::Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_lock_basic_acquire_release() {
        let lock = DialLock::new(1);
        assert!(lock.acquire(1));
        // A second acquire from this node observes our own id and gives
        // up instead of deadlocking.
        assert!(!lock.acquire(1));
        assert!(!lock.acquire(42));
        lock.release();
        assert!(lock.acquire(42));
        lock.release();
    }

    #[test]
    fn dial_lock_waits_out_other_holders() {
        use std::sync::atomic::AtomicBool;

        let lock = Arc::new(DialLock::new(1));
        // Node 7's accept currently holds the word.
        assert!(lock.acquire(7));

        let released = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = Arc::clone(&lock);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                // Spins until the holder frees the word (7 != my_id).
                assert!(lock.acquire(9));
                assert!(released.load(Ordering::Acquire));
                lock.release();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::Release);
        lock.release();
        handle.join().unwrap();
    }

    #[test]
    fn setup_data_round_trips() {
        let ring = RingInfo {
            ring_addr: 0x7000_0000,
            credit_addr: 0x7000_2000,
            rkey: 99,
            capacity: 4096,
            slot_size: 256,
        };
        let bytes = setup_bytes(1234, &ring);
        assert_eq!(&bytes[0..4], &1234u32.to_le_bytes());
        assert_eq!(parse_setup(&bytes), Some((1234, ring)));
        assert_eq!(parse_setup(&bytes[..8]), None);
    }

    #[test]
    fn backoff_doubles_with_jitter_and_clamps() {
        let mgr = ConnectionManager::new(3);
        let first = mgr.inner.bump_backoff();
        assert_eq!(first, MIN_BACKOFF_US);
        let second = mgr.inner.bump_backoff();
        assert_eq!(second, (MIN_BACKOFF_US + 300) * 2);
        for _ in 0..32 {
            mgr.inner.bump_backoff();
        }
        assert_eq!(mgr.inner.backoff_us.load(Ordering::Relaxed), MAX_BACKOFF_US);
    }

    #[test]
    fn get_connection_before_start_is_not_found() {
        let mgr = ConnectionManager::new(1);
        assert!(mgr.get_connection(2).unwrap_err().is_not_found());
        assert_eq!(mgr.num_connections(), 0);
    }
}
