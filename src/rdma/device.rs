//! Device discovery and protection-domain management.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use rdma_sys::*;

use crate::error::Error;

/// List of RDMA physical devices, freed on drop.
struct DeviceList {
    list: *mut *mut ibv_device,
    len: usize,
}

impl DeviceList {
    fn new() -> Result<Self> {
        let mut n = 0i32;
        let list = unsafe { ibv_get_device_list(&mut n) };
        if list.is_null() {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to list RDMA devices");
        }
        Ok(Self { list, len: n as usize })
    }

    fn iter(&self) -> impl Iterator<Item = *mut ibv_device> + '_ {
        (0..self.len).map(move |i| unsafe { *self.list.add(i) })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.list) };
    }
}

fn device_name(dev: *mut ibv_device) -> String {
    unsafe {
        let name = ibv_get_device_name(dev);
        if name.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }
}

struct ContextInner {
    ctx: NonNull<ibv_context>,
    port_num: u8,
    port_attr: ibv_port_attr,
}

unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl Drop for ContextInner {
    fn drop(&mut self) {
        unsafe { ibv_close_device(self.ctx.as_ptr()) };
    }
}

/// An opened device context resolved to one ACTIVE port.
///
/// This type is a simple wrapper of an `Arc`; cloning it shares the
/// underlying `ibv_context`.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open a device and resolve an active port on it.
    ///
    /// With `dev_name = None`, the first device owning an active port
    /// wins. With a name, that device must exist (`NotFound` otherwise)
    /// and have an active port (`Unavailable` otherwise). The same rules
    /// apply to `port`.
    pub fn open(dev_name: Option<&str>, port: Option<u8>) -> crate::Result<Self> {
        let list = DeviceList::new().map_err(Error::from)?;
        if list.len == 0 {
            return Err(Error::NotFound("no RDMA devices on this host".into()));
        }

        let mut named_missing = dev_name.is_some();
        for dev in list.iter() {
            if let Some(want) = dev_name {
                if device_name(dev) != want {
                    continue;
                }
                named_missing = false;
            }

            let ctx = unsafe { ibv_open_device(dev) };
            let Some(ctx) = NonNull::new(ctx) else {
                log::warn!("could not open device {}", device_name(dev));
                continue;
            };

            match Self::resolve_port(ctx, port) {
                Some((port_num, port_attr)) => {
                    log::debug!(
                        "opened device {} port {}",
                        device_name(dev),
                        port_num
                    );
                    return Ok(Self {
                        inner: Arc::new(ContextInner { ctx, port_num, port_attr }),
                    });
                }
                None => {
                    unsafe { ibv_close_device(ctx.as_ptr()) };
                    if dev_name.is_some() {
                        return Err(Error::Unavailable(format!(
                            "device {} has no active port",
                            dev_name.unwrap_or_default()
                        )));
                    }
                }
            }
        }

        if named_missing {
            return Err(Error::NotFound(format!(
                "device not found: {}",
                dev_name.unwrap_or_default()
            )));
        }
        Err(Error::Unavailable("no device with an active port".into()))
    }

    /// Query `port` (or scan all ports) for an ACTIVE one.
    fn resolve_port(ctx: NonNull<ibv_context>, port: Option<u8>) -> Option<(u8, ibv_port_attr)> {
        let probe = |num: u8| -> Option<ibv_port_attr> {
            let mut attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
            let ret = unsafe { ___ibv_query_port(ctx.as_ptr(), num, &mut attr) };
            (ret == 0 && attr.state == ibv_port_state::IBV_PORT_ACTIVE).then_some(attr)
        };

        if let Some(num) = port {
            return probe(num).map(|attr| (num, attr));
        }

        let mut dev_attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
        if unsafe { ibv_query_device(ctx.as_ptr(), &mut dev_attr) } != 0 {
            return None;
        }
        (1..=dev_attr.phys_port_cnt).find_map(|num| probe(num).map(|attr| (num, attr)))
    }

    /// Names of every RDMA device on this host.
    pub fn available_devices() -> crate::Result<Vec<String>> {
        let list = DeviceList::new().map_err(Error::from)?;
        if list.len == 0 {
            return Err(Error::NotFound("no RDMA devices on this host".into()));
        }
        Ok(list.iter().map(device_name).collect())
    }

    /// Get the underlying `ibv_context` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_context {
        self.inner.ctx.as_ptr()
    }

    /// The resolved active port number.
    #[inline]
    pub fn port_num(&self) -> u8 {
        self.inner.port_num
    }

    /// The LID of the resolved port.
    #[inline]
    pub fn lid(&self) -> u16 {
        self.inner.port_attr.lid
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("ctx", &self.inner.ctx.as_ptr())
            .field("port", &self.inner.port_num)
            .finish()
    }
}

struct PdInner {
    /// Kept alive for as long as the PD exists; `None` when the PD was
    /// adopted from an `rdma_cm` id whose context the id owns.
    _ctx: Option<Context>,
    pd: NonNull<ibv_pd>,
    owned: bool,
}

unsafe impl Send for PdInner {}
unsafe impl Sync for PdInner {}

impl Drop for PdInner {
    fn drop(&mut self) {
        if self.owned {
            unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        }
    }
}

/// Protection domain handle.
///
/// This type is a simple wrapper of an `Arc`; cloning it shares the
/// underlying `ibv_pd`.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    /// Allocate a protection domain on the given device context.
    pub fn alloc(ctx: Context) -> crate::Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_raw()) }).ok_or_else(|| {
            Error::internal(format!("ibv_alloc_pd: {}", io::Error::last_os_error()))
        })?;
        Ok(Self {
            inner: Arc::new(PdInner { _ctx: Some(ctx), pd, owned: true }),
        })
    }

    /// Allocate a protection domain directly on a raw verbs context, e.g.
    /// the one an `rdma_cm` listener resolved to.
    pub(crate) fn alloc_raw(ctx: *mut ibv_context) -> crate::Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx) }).ok_or_else(|| {
            Error::internal(format!("ibv_alloc_pd: {}", io::Error::last_os_error()))
        })?;
        Ok(Self {
            inner: Arc::new(PdInner { _ctx: None, pd, owned: true }),
        })
    }

    /// Get the underlying `ibv_pd` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_pd {
        self.inner.pd.as_ptr()
    }
}

impl std::fmt::Debug for Pd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Pd<{:p}>", self.inner.pd.as_ptr()))
    }
}
