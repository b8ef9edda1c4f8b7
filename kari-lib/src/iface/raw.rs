//! Optimized raw L2 transmit path: an AF_PACKET socket bound to the device,
//! with a memory-mapped TPACKET_V2 TX ring when the kernel grants one and a
//! per-frame non-blocking send fallback otherwise.

use socket2::SockRef;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use tracing::{info, warn};

use super::timestamp;
use crate::error::{EngineError, Result};

const ETH_P_ALL: u16 = 0x0003;
const SOL_PACKET: libc::c_int = 263;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_TX_RING: libc::c_int = 13;
const TPACKET_V2: libc::c_int = 1;

const TP_STATUS_AVAILABLE: u32 = 0;
const TP_STATUS_SEND_REQUEST: u32 = 1;

const RING_BLOCK_SIZE: u32 = 4096;
const RING_BLOCK_COUNT: u32 = 256;
const RING_FRAME_SIZE: u32 = 2048;
// tpacket2_hdr rounded up to TPACKET_ALIGNMENT.
const TX_FRAME_DATA_OFFSET: usize = 32;

const SOCKET_BUFFER_BYTES: usize = 16 * 1024 * 1024;

#[repr(C)]
struct TpacketReq {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
}

pub struct RawPort {
    fd: OwnedFd,
    ring: Option<TxRing>,
    hw_timestamps: bool,
}

impl RawPort {
    /// Opens and binds a raw socket on `name`. Fails with a precise message
    /// when the process lacks raw-socket privilege.
    pub fn open(name: &str, zero_copy: bool) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from(ETH_P_ALL.to_be()),
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(EngineError::Fatal(format!(
                    "raw socket on {name} requires CAP_NET_RAW: {err}"
                )));
            }
            return Err(EngineError::Fatal(format!(
                "raw socket on {name} failed: {err}"
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let c_name = CString::new(name)
            .map_err(|_| EngineError::Config(format!("invalid interface name {name:?}")))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(EngineError::UnknownInterface(name.to_string()));
        }

        let sock = SockRef::from(&fd);
        sock.set_send_buffer_size(SOCKET_BUFFER_BYTES)?;
        sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES)?;

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
        sll.sll_protocol = ETH_P_ALL.to_be();
        sll.sll_ifindex = ifindex as i32;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&sll as *const libc::sockaddr_ll).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(EngineError::Fatal(format!(
                "binding raw socket to {name} failed: {}",
                io::Error::last_os_error()
            )));
        }

        let hw_timestamps = timestamp::enable_hw_timestamps(fd.as_raw_fd(), name);

        let ring = if zero_copy {
            match TxRing::create(fd.as_raw_fd()) {
                Ok(ring) => {
                    info!(interface = name, frames = ring.frame_count, "tx ring mapped");
                    Some(ring)
                }
                Err(err) => {
                    info!(interface = name, %err, "tx ring unavailable, using per-frame send");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            fd,
            ring,
            hw_timestamps,
        })
    }

    pub fn hw_timestamps(&self) -> bool {
        self.hw_timestamps
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }

    /// Best-effort batched transmit; returns the number of frames accepted.
    pub fn send_batch(&mut self, frames: &[&[u8]]) -> usize {
        match &mut self.ring {
            Some(ring) => ring.send_batch(self.fd.as_raw_fd(), frames),
            None => {
                let mut sent = 0;
                for frame in frames {
                    let rc = unsafe {
                        libc::send(
                            self.fd.as_raw_fd(),
                            frame.as_ptr().cast(),
                            frame.len(),
                            libc::MSG_DONTWAIT,
                        )
                    };
                    if rc < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() != io::ErrorKind::WouldBlock {
                            warn!(%err, "raw send failed");
                        }
                        break;
                    }
                    sent += 1;
                }
                sent
            }
        }
    }

    /// Non-blocking receive of one frame.
    pub fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc > 0 {
            Some(rc as usize)
        } else {
            None
        }
    }

    pub fn tx_timestamp(&self) -> Option<u64> {
        timestamp::read_tx_timestamp(self.fd.as_raw_fd())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Memory-mapped TPACKET_V2 transmit ring.
struct TxRing {
    base: NonNull<u8>,
    map_len: usize,
    frame_size: usize,
    frame_count: usize,
    next: usize,
}

unsafe impl Send for TxRing {}

impl TxRing {
    fn create(fd: RawFd) -> io::Result<TxRing> {
        let version = TPACKET_V2;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                SOL_PACKET,
                PACKET_VERSION,
                (&version as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let req = TpacketReq {
            tp_block_size: RING_BLOCK_SIZE,
            tp_block_nr: RING_BLOCK_COUNT,
            tp_frame_size: RING_FRAME_SIZE,
            tp_frame_nr: RING_BLOCK_SIZE * RING_BLOCK_COUNT / RING_FRAME_SIZE,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                SOL_PACKET,
                PACKET_TX_RING,
                (&req as *const TpacketReq).cast(),
                std::mem::size_of::<TpacketReq>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let map_len = (RING_BLOCK_SIZE * RING_BLOCK_COUNT) as usize;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(TxRing {
            base: unsafe { NonNull::new_unchecked(base.cast()) },
            map_len,
            frame_size: RING_FRAME_SIZE as usize,
            frame_count: req.tp_frame_nr as usize,
            next: 0,
        })
    }

    fn send_batch(&mut self, fd: RawFd, frames: &[&[u8]]) -> usize {
        let mut queued = 0;
        for frame in frames {
            if frame.len() > self.frame_size - TX_FRAME_DATA_OFFSET {
                break;
            }
            let slot = unsafe { self.base.as_ptr().add(self.next * self.frame_size) };
            let status = unsafe { std::ptr::read_volatile(slot.cast::<u32>()) };
            if status != TP_STATUS_AVAILABLE {
                break;
            }
            unsafe {
                std::ptr::write(slot.add(4).cast::<u32>(), frame.len() as u32);
                std::ptr::copy_nonoverlapping(
                    frame.as_ptr(),
                    slot.add(TX_FRAME_DATA_OFFSET),
                    frame.len(),
                );
                std::ptr::write_volatile(slot.cast::<u32>(), TP_STATUS_SEND_REQUEST);
            }
            self.next = (self.next + 1) % self.frame_count;
            queued += 1;
        }
        if queued > 0 {
            unsafe { libc::send(fd, std::ptr::null(), 0, libc::MSG_DONTWAIT) };
        }
        queued
    }
}

impl Drop for TxRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.map_len);
        }
    }
}
