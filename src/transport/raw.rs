//! Raw IPv4 socket endpoint
//!
//! Opens `SOCK_RAW` bound to the tunnel's protocol number with `IP_HDRINCL`
//! set, so we hand the kernel complete datagrams including our own outer
//! header. Reads return whole IPv4 datagrams, header included; the kernel only
//! delivers datagrams carrying our protocol number.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::{classify_io, PacketEndpoint, RecvBuffer};
use crate::error::{Error, Result};
use crate::header::{MAX_DATAGRAM_LEN, OUTER_HEADER_LEN};

/// Raw datagram channel to the peer
pub struct RawSocket {
    socket: AsyncFd<Socket>,
    name: String,
    remote: Ipv4Addr,
    buf: RecvBuffer,
}

impl RawSocket {
    /// Open the raw socket. Requires `CAP_NET_RAW` and a tokio runtime.
    pub fn open(protocol: u8, local: Option<Ipv4Addr>, remote: Ipv4Addr) -> Result<Self> {
        let name = format!("raw/{}", protocol);
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(i32::from(protocol))))
            .map_err(|e| Error::setup(&name, e))?;

        // Header-included mode: the outer header is ours
        let optval: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Error::setup(&name, io::Error::last_os_error()));
        }

        socket.set_nonblocking(true).map_err(|e| Error::setup(&name, e))?;
        if let Some(local) = local {
            socket
                .bind(&SockAddr::from(SocketAddrV4::new(local, 0)))
                .map_err(|e| Error::setup(&name, format!("bind {}: {}", local, e)))?;
        }

        let socket = AsyncFd::new(socket).map_err(|e| Error::setup(&name, e))?;
        debug!("Raw socket {} opened towards {}", name, remote);
        Ok(Self {
            socket,
            name,
            remote,
            buf: RecvBuffer::new(MAX_DATAGRAM_LEN),
        })
    }
}

/// Outer destination written in the header, or the configured peer
fn destination_of(datagram: &[u8], fallback: Ipv4Addr) -> Ipv4Addr {
    if datagram.len() >= OUTER_HEADER_LEN {
        Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19])
    } else {
        fallback
    }
}

#[async_trait]
impl PacketEndpoint for RawSocket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Bytes> {
        loop {
            let mut guard = self
                .socket
                .readable()
                .await
                .map_err(|e| Error::closed(&self.name, e))?;
            let buf = self.buf.spare();
            match guard.try_io(|inner| {
                let mut sock: &Socket = inner.get_ref();
                sock.read(buf)
            }) {
                Ok(Ok(n)) => return Ok(self.buf.take(n)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(classify_io(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        let target = SockAddr::from(SocketAddrV4::new(destination_of(packet, self.remote), 0));
        loop {
            let mut guard = self
                .socket
                .writable()
                .await
                .map_err(|e| Error::closed(&self.name, e))?;
            match guard.try_io(|inner| inner.get_ref().send_to(packet, &target)) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(classify_io(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }
}
