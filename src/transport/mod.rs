//! Packet endpoints
//!
//! The dispatcher moves packets between two endpoints:
//!
//! - the local endpoint ([`TunDevice`]) carries plaintext inner IP packets
//!   to and from the kernel;
//! - the remote endpoint ([`RawSocket`]) carries whole outer IPv4 datagrams
//!   to and from the peer.
//!
//! [`ChannelEndpoint`] is an in-memory stand-in for either side.
//!
//! Endpoints absorb `WouldBlock` and `EINTR` themselves by waiting for the
//! next readiness event. Anything that means the handle is gone surfaces as
//! [`Error::EndpointClosed`]; per-packet refusals (no route, message too big)
//! surface as [`Error::PacketRejected`].

mod channel;
#[cfg(unix)]
mod raw;
#[cfg(target_os = "linux")]
mod tun;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

pub use channel::{channel_pair, ChannelEndpoint};
#[cfg(unix)]
pub use raw::RawSocket;
#[cfg(target_os = "linux")]
pub use tun::TunDevice;

/// One side of the tunnel
#[async_trait]
pub trait PacketEndpoint: Send {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Wait for and return the next packet
    async fn recv(&mut self) -> Result<Bytes>;

    /// Transmit one packet
    async fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// Receive buffer reused across reads. Each delivered packet is split off
/// the front, so only the bytes it consumed are zeroed again on refill.
#[derive(Debug)]
pub(crate) struct RecvBuffer {
    buf: BytesMut,
    size: usize,
}

impl RecvBuffer {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
            size,
        }
    }

    /// Space for one read of up to `size` bytes
    pub(crate) fn spare(&mut self) -> &mut [u8] {
        self.buf.resize(self.size, 0);
        &mut self.buf[..]
    }

    /// Take the first `n` bytes written by the last read
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n.min(self.buf.len())).freeze()
    }
}

/// Sort an I/O failure into "handle is gone" or "this packet was refused"
#[cfg(unix)]
pub(crate) fn classify_io(endpoint: &str, err: std::io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::EBADF | libc::EIO | libc::ENODEV | libc::ENXIO | libc::EPIPE | libc::ENOTSOCK) => {
            Error::closed(endpoint, err)
        }
        Some(_) => Error::rejected(endpoint, err),
        None => Error::closed(endpoint, err),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_recv_buffer_reuse() {
        let mut buf = RecvBuffer::new(64);
        assert_eq!(buf.spare().len(), 64);
        buf.spare()[..3].copy_from_slice(b"one");
        let first = buf.take(3);

        let spare = buf.spare();
        assert_eq!(spare.len(), 64);
        spare[..5].copy_from_slice(b"two!!");
        let second = buf.take(5);

        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two!!");
        assert_eq!(buf.take(1000).len(), 59);
    }

    #[test]
    fn test_classify_io() {
        let gone = classify_io("tun", std::io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(gone, Error::EndpointClosed { .. }));

        let refused = classify_io("raw", std::io::Error::from_raw_os_error(libc::EHOSTUNREACH));
        assert!(matches!(refused, Error::PacketRejected { .. }));
    }
}
