//! TX/RX timestamping: PTP-style hardware timestamps where the NIC offers
//! them, a software monotonic sample otherwise.

use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info};

// Linux SO_TIMESTAMPING option and flag bits.
const SO_TIMESTAMPING: libc::c_int = 37;
const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds on the process-wide monotonic clock.
pub fn monotonic_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Attempts to enable hardware timestamping on a raw socket. Returns whether
/// the option was accepted.
pub fn enable_hw_timestamps(fd: RawFd, interface: &str) -> bool {
    let flags: u32 = SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_SOFTWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_TIMESTAMPING,
            (&flags as *const u32).cast(),
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        info!(interface, "hardware timestamping enabled");
        true
    } else {
        info!(
            interface,
            error = %std::io::Error::last_os_error(),
            "hardware timestamping unavailable, using software timestamps"
        );
        false
    }
}

/// Drains one TX timestamp from the socket error queue, in nanoseconds.
///
/// Prefers the raw hardware timestamp (third timespec of the control block),
/// falling back to the software one.
pub fn read_tx_timestamp(fd: RawFd) -> Option<u64> {
    let mut data = [0u8; 1];
    let mut control = [0u8; 512];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
    if n < 0 {
        return None;
    }
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == SO_TIMESTAMPING {
                let stamps =
                    std::slice::from_raw_parts(libc::CMSG_DATA(cmsg).cast::<libc::timespec>(), 3);
                for ts in [&stamps[2], &stamps[0]] {
                    if ts.tv_sec != 0 || ts.tv_nsec != 0 {
                        return Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64);
                    }
                }
                debug!("timestamp control block carried no usable stamp");
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    None
}
