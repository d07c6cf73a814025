//! Outer IPv4 header
//!
//! Wire layout (20 bytes, no options):
//! ```text
//!  0          4          8                16    19                    31
//! +----------+----------+-----------------+-----+---------------------+
//! | ver = 4  | IHL = 5  |       TOS       |      total length         |
//! +----------+----------+-----------------+-----+---------------------+
//! |      identification = 0               |flags|  fragment offset    |
//! +---------------------+-----------------+-----+---------------------+
//! |        TTL          |    protocol     |     header checksum       |
//! +---------------------+-----------------+---------------------------+
//! |                       source address                              |
//! +-------------------------------------------------------------------+
//! |                    destination address                            |
//! +-------------------------------------------------------------------+
//! ```

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};

use crate::checksum::checksum16;
use crate::config::PeerConfig;
use crate::error::PacketError;

/// Size of the outer header in bytes
pub const OUTER_HEADER_LEN: usize = 20;

/// Largest value the total-length field can hold
pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// Don't-fragment bit within the flags/fragment-offset word
pub const FLAG_DONT_FRAGMENT: u16 = 0x4000;

const CHECKSUM_OFFSET: usize = 10;

/// Parsed or constructed outer IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterHeader {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl OuterHeader {
    /// Serialize to the 20-byte wire form, with the stored checksum
    pub fn encode(&self) -> [u8; OUTER_HEADER_LEN] {
        let mut out = [0u8; OUTER_HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u8((self.version << 4) | (self.ihl & 0x0f));
        buf.put_u8(self.tos);
        buf.put_u16(self.total_length);
        buf.put_u16(self.identification);
        buf.put_u16(self.flags_fragment);
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u16(self.checksum);
        buf.put_slice(&self.source.octets());
        buf.put_slice(&self.destination.octets());
        out
    }

    /// Parse the first 20 bytes of `data`. No validation beyond length.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < OUTER_HEADER_LEN {
            return Err(PacketError::TruncatedDatagram(data.len()));
        }
        let mut buf = &data[..OUTER_HEADER_LEN];
        let ver_ihl = buf.get_u8();
        let tos = buf.get_u8();
        let total_length = buf.get_u16();
        let identification = buf.get_u16();
        let flags_fragment = buf.get_u16();
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        let checksum = buf.get_u16();
        let source = Ipv4Addr::from(buf.get_u32());
        let destination = Ipv4Addr::from(buf.get_u32());
        Ok(Self {
            version: ver_ihl >> 4,
            ihl: ver_ihl & 0x0f,
            tos,
            total_length,
            identification,
            flags_fragment,
            ttl,
            protocol,
            checksum,
            source,
            destination,
        })
    }

    /// Checksum of this header computed with the checksum field zeroed
    pub fn compute_checksum(&self) -> u16 {
        let mut bytes = self.encode();
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        checksum16(&bytes)
    }

    pub fn checksum_valid(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Number of payload bytes the header claims follow it
    pub fn payload_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(OUTER_HEADER_LEN)
    }
}

/// Build the outer header for a payload of `payload_len` bytes sent to the peer.
///
/// The caller guarantees `OUTER_HEADER_LEN + payload_len` fits the
/// total-length field.
pub fn build_header(peer: &PeerConfig, payload_len: usize) -> OuterHeader {
    debug_assert!(payload_len + OUTER_HEADER_LEN <= MAX_DATAGRAM_LEN);
    let mut header = OuterHeader {
        version: 4,
        ihl: 5,
        tos: peer.tos,
        total_length: (OUTER_HEADER_LEN + payload_len) as u16,
        identification: 0,
        flags_fragment: if peer.pmtu_discovery { FLAG_DONT_FRAGMENT } else { 0 },
        ttl: peer.ttl,
        protocol: peer.protocol,
        checksum: 0,
        source: peer.local_address,
        destination: peer.remote_address,
    };
    header.checksum = header.compute_checksum();
    header
}
