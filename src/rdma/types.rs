//! Thin `NonNull` newtypes around `rdma_cm` resources.
//!
//! The raw structs are neither `Send` nor `Sync` as far as rustc can
//! tell, but the userspace drivers allow handing them between threads as
//! long as each call site serializes access. The wrappers make that
//! contract explicit and keep pointer plumbing out of the higher layers.

use std::ptr::NonNull;

use rdma_sys::*;

macro_rules! impl_cm_wrapper_traits {
    ($raw_ty:ty, $wrapper_ty:ty) => {
        impl ::std::ops::Deref for $wrapper_ty {
            type Target = ::std::ptr::NonNull<$raw_ty>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<::std::ptr::NonNull<$raw_ty>> for $wrapper_ty {
            fn from(pointer: ::std::ptr::NonNull<$raw_ty>) -> Self {
                Self(pointer)
            }
        }

        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}

/// Wrapper for `*mut rdma_cm_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct CmId(NonNull<rdma_cm_id>);

impl CmId {
    pub(crate) fn new(id: *mut rdma_cm_id) -> Option<Self> {
        NonNull::new(id).map(Self)
    }

    /// The queue pair bound to this id, if one has been created.
    #[inline]
    pub fn qp(&self) -> *mut ibv_qp {
        unsafe { self.0.as_ref().qp }
    }

    /// The send completion queue of the id's QP.
    #[inline]
    pub fn send_cq(&self) -> *mut ibv_cq {
        unsafe { self.0.as_ref().send_cq }
    }

    /// The verbs context the id resolved to.
    #[inline]
    pub fn verbs(&self) -> *mut ibv_context {
        unsafe { self.0.as_ref().verbs }
    }

    /// The protection domain the id's QP was created under.
    #[inline]
    pub fn pd(&self) -> *mut ibv_pd {
        unsafe { self.0.as_ref().pd }
    }

    /// The event channel the id reports on.
    #[inline]
    pub fn event_channel(&self) -> *mut rdma_event_channel {
        unsafe { self.0.as_ref().channel }
    }
}

impl_cm_wrapper_traits!(rdma_cm_id, CmId);

/// Wrapper for `*mut rdma_cm_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct CmEvent(NonNull<rdma_cm_event>);

impl CmEvent {
    pub(crate) fn new(event: *mut rdma_cm_event) -> Option<Self> {
        NonNull::new(event).map(Self)
    }

    #[inline]
    pub fn event_type(&self) -> rdma_cm_event_type::Type {
        unsafe { self.0.as_ref().event }
    }

    #[inline]
    pub fn id(&self) -> *mut rdma_cm_id {
        unsafe { self.0.as_ref().id }
    }

    /// The connection private data attached by the remote side, as a byte
    /// slice. Empty if the event carries none.
    pub fn private_data(&self) -> &[u8] {
        let conn = unsafe { &self.0.as_ref().param.conn };
        if conn.private_data.is_null() || conn.private_data_len == 0 {
            &[]
        } else {
            unsafe {
                std::slice::from_raw_parts(conn.private_data as *const u8, conn.private_data_len as usize)
            }
        }
    }

    /// Acknowledge the event, returning it to the kernel.
    pub fn ack(self) {
        unsafe { rdma_ack_cm_event(self.0.as_ptr()) };
    }

    /// Human-readable event name, for logging.
    pub fn type_str(&self) -> String {
        unsafe {
            std::ffi::CStr::from_ptr(rdma_event_str(self.event_type()))
                .to_string_lossy()
                .into_owned()
        }
    }
}

impl_cm_wrapper_traits!(rdma_cm_event, CmEvent);

/// Wrapper for `*mut rdma_event_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EventChannel(NonNull<rdma_event_channel>);

impl EventChannel {
    pub(crate) fn new(ch: *mut rdma_event_channel) -> Option<Self> {
        NonNull::new(ch).map(Self)
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        unsafe { self.0.as_ref().fd }
    }
}

impl_cm_wrapper_traits!(rdma_event_channel, EventChannel);
