//! `rdma_cm` event brokering.
//!
//! One broker owns one non-blocking event channel plus the listening id
//! bound to it, and runs a single thread that translates `rdma_cm`
//! events into [`Receiver`] callbacks. Acking `CONNECT_REQUEST` and
//! `ESTABLISHED` events is the callback's job so that it controls when
//! the kernel may reuse the id; `DISCONNECTED` events are acked here.

use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rdma_sys::*;

use crate::error::{Error, Result};
use crate::rdma::device::{Context, Pd};
use crate::rdma::types::{CmEvent, CmId, EventChannel};
use crate::utils::{errno, from_c_ret_ctx, sockaddr_in};

/// Callbacks invoked by the broker's event thread.
pub trait Receiver: Send + Sync {
    /// A remote peer asked to connect. The implementation should create
    /// or assign a QP to `id`, accept or reject, and ack `event`.
    fn on_connect_request(&self, id: CmId, event: CmEvent);

    /// A connection reached the established state. The implementation
    /// must ack `event`.
    fn on_established(&self, id: CmId, event: CmEvent);

    /// The peer disconnected. The event is already acked; `id` is dead
    /// after this call returns.
    fn on_disconnect(&self, id: CmId);
}

/// Owner of an `rdma_cm` event channel and its listener.
pub struct Broker {
    channel: EventChannel,
    listen_id: CmId,
    addr: Ipv4Addr,
    port: u16,
    pd: Pd,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Broker {
    /// Bind to `addr` (empty selects the host's primary local IP) and an
    /// optional port (`None` lets the kernel pick an ephemeral one), then
    /// start the event thread dispatching into `receiver`.
    pub fn bind(addr: &str, port: Option<u16>, receiver: Arc<dyn Receiver>) -> Result<Broker> {
        let addr = resolve_addr(addr)?;

        let channel = EventChannel::new(unsafe { rdma_create_event_channel() })
            .ok_or_else(|| Error::internal("rdma_create_event_channel failed"))?;
        set_nonblocking(channel.fd())?;

        let mut raw_id: *mut rdma_cm_id = ptr::null_mut();
        unsafe {
            if let Err(e) = from_c_ret_ctx(
                rdma_create_id(
                    channel.as_ptr(),
                    &mut raw_id,
                    ptr::null_mut(),
                    rdma_port_space::RDMA_PS_TCP,
                ),
                "rdma_create_id",
            ) {
                rdma_destroy_event_channel(channel.as_ptr());
                return Err(e.into());
            }
        }
        let listen_id = CmId::new(raw_id).expect("rdma_create_id returned null id");

        let cleanup = |e: Error| {
            unsafe {
                rdma_destroy_id(listen_id.as_ptr());
                rdma_destroy_event_channel(channel.as_ptr());
            }
            e
        };

        let mut sin = sockaddr_in(addr, port.unwrap_or(0));
        unsafe {
            from_c_ret_ctx(
                rdma_bind_addr(listen_id.as_ptr(), &mut sin as *mut _ as *mut libc::sockaddr),
                "rdma_bind_addr",
            )
            .map_err(|e| cleanup(e.into()))?;
            from_c_ret_ctx(rdma_listen(listen_id.as_ptr(), 10), "rdma_listen")
                .map_err(|e| cleanup(e.into()))?;
        }

        let port = u16::from_be(unsafe { rdma_get_src_port(listen_id.as_ptr()) });

        // Binding to a concrete address resolves the listener to one
        // device; a wildcard bind leaves `verbs` null and the PD comes
        // from the first active device instead.
        let pd = if !listen_id.verbs().is_null() {
            Pd::alloc_raw(listen_id.verbs()).map_err(&cleanup)?
        } else {
            Context::open(None, None)
                .and_then(Pd::alloc)
                .map_err(&cleanup)?
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let channel = channel;
            std::thread::Builder::new()
                .name("remex-broker".into())
                .spawn(move || event_loop(channel, receiver, stop))
                .map_err(|e| cleanup(Error::internal(format!("broker thread: {}", e))))?
        };

        log::info!("broker listening on {}:{}", addr, port);
        Ok(Broker {
            channel,
            listen_id,
            addr,
            port,
            pd,
            stop,
            thread: Some(thread),
        })
    }

    /// The bound address.
    pub fn address(&self) -> Ipv4Addr {
        self.addr
    }

    /// The bound (possibly kernel-chosen) port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The protection domain shared by every connection this broker
    /// accepts.
    pub fn pd(&self) -> Pd {
        self.pd.clone()
    }

    /// Stop the event thread. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::internal("broker event thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.stop();
        unsafe {
            rdma_destroy_id(self.listen_id.as_ptr());
            rdma_destroy_event_channel(self.channel.as_ptr());
        }
    }
}

fn event_loop(channel: EventChannel, receiver: Arc<dyn Receiver>, stop: Arc<AtomicBool>) {
    loop {
        let mut raw_event: *mut rdma_cm_event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(channel.as_ptr(), &mut raw_event) };
        if ret != 0 {
            if errno() == libc::EAGAIN {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(Duration::from_micros(50));
                continue;
            }
            log::error!(
                "rdma_get_cm_event(): {}; broker exiting",
                std::io::Error::last_os_error()
            );
            return;
        }

        let event = CmEvent::new(raw_event).expect("rdma_get_cm_event returned null event");
        let id = match CmId::new(event.id()) {
            Some(id) => id,
            None => {
                event.ack();
                continue;
            }
        };
        log::trace!("broker event: {}", event.type_str());

        match event.event_type() {
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                receiver.on_connect_request(id, event);
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                receiver.on_established(id, event);
            }
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => {
                event.ack();
                receiver.on_disconnect(id);
            }
            other => {
                log::debug!("broker ignoring event: {}", event.type_str());
                let _ = other;
                event.ack();
            }
        }
    }
}

fn resolve_addr(addr: &str) -> Result<Ipv4Addr> {
    if addr.is_empty() {
        match local_ip_address::local_ip() {
            Ok(std::net::IpAddr::V4(v4)) => Ok(v4),
            Ok(other) => Err(Error::internal(format!(
                "local address {} is not IPv4",
                other
            ))),
            Err(e) => Err(Error::internal(format!("local address lookup: {}", e))),
        }
    } else {
        addr.parse::<Ipv4Addr>()
            .map_err(|e| Error::internal(format!("bad bind address {:?}: {}", addr, e)))
    }
}

pub(crate) fn set_nonblocking(fd: i32) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::internal(format!(
            "fcntl(F_GETFL): {}",
            std::io::Error::last_os_error()
        )));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::internal(format!(
            "fcntl(F_SETFL): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
