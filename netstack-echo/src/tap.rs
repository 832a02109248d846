//! A Linux TAP device as a [`PhysicalAdapter`].
//!
//! Opens `/dev/net/tun` and attaches it to an existing (or kernel-created) TAP interface with
//! `TUNSETIFF`, the same ioctl dance every Linux TAP client uses. `receive` drains the device
//! non-blocking, mirroring the polling run loop the dataplane core runs: there is no suspension
//! point here, only "is there a frame or not".

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use log::warn;

use netstack::adapter::PhysicalAdapter;
use netstack::buffer::{Cursor, CursorMut};
use netstack::wire::ethernet::{Address, HEADER_LEN};

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFNAMSIZ: usize = 16;

/// Matches the kernel's `struct ifreq` closely enough for `TUNSETIFF`: an interface name
/// followed by the `ifr_flags` member of the anonymous union, padded out to the union's size.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// The device's own MTU plus the Ethernet header, i.e. the largest frame it will hand us or
/// accept from us.
const DEFAULT_MTU: usize = 1500;

pub struct TapDevice {
    fd: RawFd,
    addr: Address,
    max_packet_size: usize,
}

impl TapDevice {
    /// Open `name`, creating it if the kernel doesn't already have an interface by that name.
    /// `addr` is the Ethernet address this adapter reports as its own; a TAP device has no
    /// hardware address of its own to query, so the caller supplies one.
    pub fn open(name: &str, addr: Address) -> io::Result<Self> {
        if name.len() >= IFNAMSIZ {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tap device name too long"));
        }

        let path = CString::new("/dev/net/tun").expect("no interior nul");
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut req: IfReq = unsafe { std::mem::zeroed() };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        req.flags = IFF_TAP | IFF_NO_PI;

        if unsafe { libc::ioctl(fd, TUNSETIFF as _, &req) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(TapDevice { fd, addr, max_packet_size: HEADER_LEN + DEFAULT_MTU })
    }
}

impl PhysicalAdapter for TapDevice {
    fn addr(&self) -> Address {
        self.addr
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn receive(&mut self, handler: &mut dyn FnMut(Cursor)) {
        let mut buf = vec![0u8; self.max_packet_size];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!("tap read failed: {}", err);
                }
                break;
            }
            if n == 0 {
                break;
            }
            handler(Cursor::new(&buf[..n as usize]));
        }
    }

    fn send_packet(&mut self, size: usize, writer: &mut dyn FnMut(CursorMut)) {
        let mut buf = vec![0u8; size];
        writer(CursorMut::new(&mut buf));
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            warn!("tap write failed: {}", io::Error::last_os_error());
        }
    }

    fn get_current_tcp_seq(&self) -> u32 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        let cycles = (ts.tv_sec as u64).wrapping_mul(1_000_000_000).wrapping_add(ts.tv_nsec as u64);
        // One tick every 4 microseconds, matching the classical ISS generator's cadence.
        netstack::stack::iss_from_cycles(cycles, 4_000)
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
