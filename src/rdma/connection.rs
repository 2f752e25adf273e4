//! An established connection to one peer.

use std::ptr;
use std::time::{Duration, Instant};

use rdma_sys::*;

use crate::rdma::channel::Channel;
use crate::rdma::types::{CmId, EventChannel};
use crate::utils::errno;

/// One established RDMA connection: the `rdma_cm_id` (and with it the
/// RC queue pair), the ring message channel layered over it, and, for
/// outbound dials, the private event channel the dial ran on.
///
/// Dropping a connection disconnects it, drains whatever events the
/// disconnect produces, and destroys the endpoint. Loopback connections
/// were never negotiated through `rdma_cm`, so they skip the disconnect
/// handshake.
pub struct Connection {
    my_id: u16,
    peer_id: u16,
    id: CmId,
    channel: Channel,
    dial_channel: Option<EventChannel>,
    loopback: bool,
}

impl Connection {
    pub(crate) fn new(
        my_id: u16,
        peer_id: u16,
        id: CmId,
        channel: Channel,
        dial_channel: Option<EventChannel>,
    ) -> Self {
        Self {
            my_id,
            peer_id,
            id,
            channel,
            dial_channel,
            loopback: my_id == peer_id,
        }
    }

    /// Local node id.
    pub fn my_id(&self) -> u16 {
        self.my_id
    }

    /// Remote node id.
    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    /// The message channel bound to this connection.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The underlying `rdma_cm_id`.
    pub fn id(&self) -> CmId {
        self.id
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }
}

/// Ack everything pending on `id`'s event channel, waiting up to
/// `timeout` for the disconnect handshake to produce its event.
fn drain_events(id: CmId, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let mut event: *mut rdma_cm_event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(id.event_channel(), &mut event) };
        if ret == 0 {
            unsafe { rdma_ack_cm_event(event) };
            continue;
        }
        if errno() != libc::EAGAIN || Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        log::debug!(
            "(node {}) tearing down connection to node {}",
            self.my_id,
            self.peer_id
        );
        unsafe {
            if !self.loopback {
                rdma_disconnect(self.id.as_ptr());
                drain_events(self.id, Duration::from_millis(100));
            }
            rdma_destroy_ep(self.id.as_ptr());
            if let Some(ch) = self.dial_channel.take() {
                rdma_destroy_event_channel(ch.as_ptr());
            }
        }
    }
}
