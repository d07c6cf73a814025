//! TUN device endpoint
//!
//! Creates a point-to-point virtual interface using the Linux TUN driver in
//! `IFF_NO_PI` mode, so every read and write is exactly one raw IP packet.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Command;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use super::{classify_io, PacketEndpoint, RecvBuffer};
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int)
// PowerPC encodes ioctl direction bits differently from x86/ARM:
//   x86/ARM: _IOC_WRITE = 1  → TUNSETIFF = 0x400454ca
//   PowerPC: _IOC_WRITE = 4  → TUNSETIFF = 0x800454ca
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

const IFNAMSIZ: usize = 16;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A Linux TUN device
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
    buf: RecvBuffer,
}

impl TunDevice {
    /// Create (or attach to) the TUN device `name`.
    ///
    /// `read_size` bounds a single read; packets larger than it arrive
    /// truncated, so pass at least the tunnel MTU budget plus one.
    /// Must be called from within a tokio runtime.
    pub fn create(name: &str, read_size: usize) -> Result<Self> {
        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::setup("/dev/net/tun", io::Error::last_os_error()));
        }
        // Owned from here on, closed on every early return
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut req = Ifreq {
            ifr_name: [0u8; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(IFNAMSIZ - 1);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req as *mut Ifreq) };
        if ret < 0 {
            return Err(Error::setup(name, format!("ioctl TUNSETIFF failed: {}", io::Error::last_os_error())));
        }

        let actual_name = String::from_utf8_lossy(&req.ifr_name)
            .trim_end_matches('\0')
            .to_string();

        let fd = AsyncFd::new(fd).map_err(|e| Error::setup(&actual_name, e))?;
        debug!("TUN device {} opened", actual_name);

        Ok(Self {
            fd,
            name: actual_name,
            buf: RecvBuffer::new(read_size),
        })
    }

    /// Assign an address, set the MTU and bring the interface up
    pub fn configure(&self, address: std::net::Ipv4Addr, prefix: u8, mtu: usize) -> Result<()> {
        let status = Command::new("ip")
            .args(["addr", "add", &format!("{}/{}", address, prefix), "dev", &self.name])
            .status()?;
        if !status.success() {
            return Err(Error::setup(&self.name, format!("failed to set address {}/{}", address, prefix)));
        }

        let status = Command::new("ip")
            .args(["link", "set", "dev", &self.name, "mtu", &mtu.to_string()])
            .status()?;
        if !status.success() {
            warn!("Failed to set MTU {} on {}", mtu, self.name);
        }

        let status = Command::new("ip")
            .args(["link", "set", "dev", &self.name, "up"])
            .status()?;
        if !status.success() {
            return Err(Error::setup(&self.name, "failed to bring interface up"));
        }

        Ok(())
    }

    /// Get the raw file descriptor
    pub fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[async_trait]
impl PacketEndpoint for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Bytes> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| Error::closed(&self.name, e))?;
            let buf = self.buf.spare();
            match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), buf)) {
                Ok(Ok(0)) => return Err(Error::closed(&self.name, "device returned end of file")),
                Ok(Ok(n)) => return Ok(self.buf.take(n)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(Error::closed(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| Error::closed(&self.name, e))?;
            match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), packet)) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The driver refuses packets that are not IPv4/IPv6 with EINVAL
                Ok(Err(e)) => return Err(classify_io(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }
}
