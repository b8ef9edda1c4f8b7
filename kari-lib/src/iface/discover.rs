//! Live address discovery for admitted interfaces.
//!
//! Re-reads the link-layer address from sysfs and the first configured
//! IPv4/IPv6 address from the OS. First observed wins; operator-supplied
//! addresses are never overwritten by the caller.

use std::ffi::CStr;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::codec::MacAddr;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discovered {
    pub mac: Option<MacAddr>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

pub fn discover(name: &str) -> Result<Discovered> {
    let mut out = Discovered {
        mac: read_sysfs_mac(name),
        ..Discovered::default()
    };

    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(EngineError::Io(std::io::Error::last_os_error()));
        }
        let mut cursor = addrs;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;
            if entry.ifa_name.is_null() || entry.ifa_addr.is_null() {
                continue;
            }
            let ifname = CStr::from_ptr(entry.ifa_name);
            if ifname.to_bytes() != name.as_bytes() {
                continue;
            }
            match i32::from((*entry.ifa_addr).sa_family) {
                libc::AF_INET if out.ipv4.is_none() => {
                    let sin = &*entry.ifa_addr.cast::<libc::sockaddr_in>();
                    out.ipv4 = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                }
                libc::AF_INET6 if out.ipv6.is_none() => {
                    let sin6 = &*entry.ifa_addr.cast::<libc::sockaddr_in6>();
                    out.ipv6 = Some(Ipv6Addr::from(sin6.sin6_addr.s6_addr));
                }
                _ => {}
            }
        }
        libc::freeifaddrs(addrs);
    }

    Ok(out)
}

fn read_sysfs_mac(name: &str) -> Option<MacAddr> {
    let path = format!("/sys/class/net/{name}/address");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
