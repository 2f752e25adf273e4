use std::io;
use std::mem;
use std::net::Ipv4Addr;

use anyhow::Result;

/// Converts a C return value to a Rust `Result`.
///
/// Verbs and `rdma_cm` calls return 0 on success. On failure some return
/// the (positive) error code directly and some return -1 with `errno`
/// set, so fall back to `errno` when the return value itself carries no
/// information.
pub(crate) fn from_c_ret(ret: i32) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else if ret > 0 {
        Err(anyhow::anyhow!(io::Error::from_raw_os_error(ret)))
    } else {
        Err(anyhow::anyhow!(io::Error::last_os_error()))
    }
}

/// Like [`from_c_ret`], but prepends the failing call's name.
pub(crate) fn from_c_ret_ctx(ret: i32, what: &'static str) -> Result<()> {
    from_c_ret(ret).map_err(|e| anyhow::anyhow!("{}(): {}", what, e))
}

/// The current `errno` value.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Build an IPv4 `sockaddr_in` in network byte order.
pub(crate) fn sockaddr_in(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = port.to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_ret_zero_is_ok() {
        assert!(from_c_ret(0).is_ok());
    }

    #[test]
    fn c_ret_positive_is_errno_code() {
        let err = from_c_ret(libc::EINVAL).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("invalid"));
    }

    #[test]
    fn sockaddr_is_network_order() {
        let sin = sockaddr_in(Ipv4Addr::new(10, 0, 0, 1), 18018);
        assert_eq!(sin.sin_port, 18018u16.to_be());
        assert_eq!(sin.sin_addr.s_addr, u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_be());
    }
}
