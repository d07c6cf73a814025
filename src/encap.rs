//! Encapsulation pipeline
//!
//! Turns an inner IP packet into an encrypted outer IPv4 datagram and back.
//! Everything here is synchronous, allocation-light and lock-free, so the same
//! [`Encapsulator`] can sit behind the user-space dispatcher or be invoked
//! per packet from a non-sleeping receive hook.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::Codec;
use crate::config::PeerConfig;
use crate::error::{Error, PacketError, Result};
use crate::header::{build_header, OuterHeader, OUTER_HEADER_LEN};
use crate::stats::TunnelStats;

/// Encapsulator bound to one peer and its key
#[derive(Debug)]
pub struct Encapsulator {
    peer: PeerConfig,
    codec: Codec,
    stats: Arc<TunnelStats>,
}

impl Encapsulator {
    /// Build an encapsulator. Fails if the peer parameters are unusable or the
    /// codec suite differs from the one the peer was configured for.
    pub fn new(peer: PeerConfig, codec: Codec) -> Result<Self> {
        Self::with_stats(peer, codec, Arc::new(TunnelStats::new()))
    }

    /// Like [`Self::new`], but keep counting into existing `stats`
    pub fn with_stats(peer: PeerConfig, codec: Codec, stats: Arc<TunnelStats>) -> Result<Self> {
        peer.validate()?;
        if codec.suite() != peer.cipher {
            return Err(Error::Config(format!(
                "codec suite {} does not match configured cipher {}",
                codec.suite(),
                peer.cipher
            )));
        }
        Ok(Self {
            peer,
            codec,
            stats,
        })
    }

    pub fn peer(&self) -> &PeerConfig {
        &self.peer
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    /// Largest inner packet accepted by [`Self::encapsulate`]
    pub fn mtu_budget(&self) -> usize {
        self.peer.mtu_budget()
    }

    /// Encrypt `inner` and prepend the outer header
    pub fn encapsulate(&self, inner: &[u8]) -> std::result::Result<Bytes, PacketError> {
        let result = self.seal(inner);
        match &result {
            Ok(_) => self.stats.record_tx(inner.len()),
            Err(e) => self.stats.record_drop(e.drop_reason()),
        }
        result
    }

    /// Validate the outer header of `outer` and decrypt its payload
    pub fn decapsulate(&self, outer: &[u8]) -> std::result::Result<Bytes, PacketError> {
        let result = self.open(outer);
        match &result {
            Ok(inner) => self.stats.record_rx(inner.len()),
            Err(e) => self.stats.record_drop(e.drop_reason()),
        }
        result
    }

    fn seal(&self, inner: &[u8]) -> std::result::Result<Bytes, PacketError> {
        let budget = self.mtu_budget();
        if inner.len() > budget {
            return Err(PacketError::PacketTooLarge {
                len: inner.len(),
                budget,
            });
        }

        let ciphertext = self.codec.encrypt(inner)?;
        let header = build_header(&self.peer, ciphertext.len());

        let mut datagram = BytesMut::with_capacity(OUTER_HEADER_LEN + ciphertext.len());
        datagram.put_slice(&header.encode());
        datagram.put_slice(&ciphertext);
        Ok(datagram.freeze())
    }

    fn open(&self, outer: &[u8]) -> std::result::Result<Bytes, PacketError> {
        let header = OuterHeader::parse(outer)?;

        if header.version != 4 {
            return Err(PacketError::MalformedHeader("version is not 4"));
        }
        if header.ihl != 5 {
            return Err(PacketError::MalformedHeader("header has options"));
        }
        let total = header.total_length as usize;
        if total < OUTER_HEADER_LEN || total > outer.len() {
            return Err(PacketError::MalformedHeader("total length disagrees with datagram"));
        }

        let computed = header.compute_checksum();
        if computed != header.checksum {
            return Err(PacketError::ChecksumMismatch {
                stored: header.checksum,
                computed,
            });
        }

        if header.protocol != self.peer.protocol || header.destination != self.peer.local_address {
            return Err(PacketError::ProtocolMismatch {
                protocol: header.protocol,
                destination: header.destination,
            });
        }

        let plaintext = self.codec.decrypt(&outer[OUTER_HEADER_LEN..total])?;
        Ok(Bytes::from(plaintext))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checksum::checksum16;
    use crate::codec::{CipherSuite, KeyMaterial};
    use crate::error::CodecError;
    use std::net::Ipv4Addr;

    pub(crate) const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    pub(crate) fn local_peer() -> PeerConfig {
        PeerConfig {
            local_address: Ipv4Addr::new(172, 17, 2, 250),
            remote_address: Ipv4Addr::new(192, 241, 228, 123),
            ..PeerConfig::default()
        }
    }

    /// The same tunnel seen from the far end
    pub(crate) fn remote_peer() -> PeerConfig {
        let p = local_peer();
        PeerConfig {
            local_address: p.remote_address,
            remote_address: p.local_address,
            ..p
        }
    }

    pub(crate) fn encapsulator(peer: PeerConfig) -> Encapsulator {
        let codec = Codec::new(peer.cipher, KeyMaterial::new(KEY.to_vec())).unwrap();
        Encapsulator::new(peer, codec).unwrap()
    }

    /// 40-byte IPv4/TCP SYN from 10.0.0.1 to 10.0.0.2
    pub(crate) fn sample_inner() -> Vec<u8> {
        let mut p = vec![
            0x45, 0x00, 0x00, 0x28, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 10, 0, 0, 1,
            10, 0, 0, 2,
        ];
        let sum = checksum16(&p);
        p[10..12].copy_from_slice(&sum.to_be_bytes());
        p.extend_from_slice(&[
            0x30, 0x39, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x50, 0x02,
            0x72, 0x10, 0x00, 0x00, 0x00, 0x00,
        ]);
        p
    }

    #[test]
    fn test_end_to_end_scenario() {
        let sender = encapsulator(local_peer());
        let receiver = encapsulator(remote_peer());
        let inner = sample_inner();
        assert_eq!(inner.len(), 40);

        let outer = sender.encapsulate(&inner).unwrap();
        assert!(outer.len() >= 60);

        let header = OuterHeader::parse(&outer).unwrap();
        assert_eq!(header.version, 4);
        assert_eq!(header.ihl, 5);
        assert_eq!(header.protocol, 253);
        assert_eq!(header.ttl, 255);
        assert_eq!(header.source, Ipv4Addr::new(172, 17, 2, 250));
        assert_eq!(header.destination, Ipv4Addr::new(192, 241, 228, 123));
        assert_eq!(header.total_length as usize, outer.len());
        assert!(header.checksum_valid());
        assert_eq!(checksum16(&outer[..OUTER_HEADER_LEN]), 0);

        let recovered = receiver.decapsulate(&outer).unwrap();
        assert_eq!(&recovered[..], &inner[..]);
        assert_eq!(sender.stats().snapshot().tx_packets, 1);
        assert_eq!(receiver.stats().snapshot().rx_bytes, 40);
    }

    #[test]
    fn test_round_trip_lengths() {
        for cipher in [CipherSuite::AesCbc, CipherSuite::ChaCha20Poly1305] {
            let key = KeyMaterial::generate(32);
            let hex = key.to_hex();
            let tx = Encapsulator::new(
                PeerConfig { cipher, ..local_peer() },
                Codec::new(cipher, key).unwrap(),
            )
            .unwrap();
            let rx = Encapsulator::new(
                PeerConfig { cipher, ..remote_peer() },
                Codec::new(cipher, KeyMaterial::from_hex(&hex).unwrap()).unwrap(),
            )
            .unwrap();

            let budget = tx.mtu_budget();
            for len in [0, 1, 20, 576, budget - 1, budget] {
                let inner: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let outer = tx.encapsulate(&inner).unwrap();
                assert!(outer.len() <= tx.peer().outer_mtu);
                assert_eq!(&rx.decapsulate(&outer).unwrap()[..], &inner[..]);
            }
        }
    }

    #[test]
    fn test_oversize_rejected() {
        let tx = encapsulator(local_peer());
        let inner = vec![0u8; tx.mtu_budget() + 1];
        assert_eq!(
            tx.encapsulate(&inner),
            Err(PacketError::PacketTooLarge {
                len: tx.mtu_budget() + 1,
                budget: tx.mtu_budget()
            })
        );
        assert_eq!(tx.stats().snapshot().dropped_oversize, 1);
        assert_eq!(tx.stats().snapshot().tx_packets, 0);
    }

    #[test]
    fn test_truncated_rejected() {
        let rx = encapsulator(remote_peer());
        for len in 0..OUTER_HEADER_LEN {
            assert_eq!(
                rx.decapsulate(&vec![0x45; len]),
                Err(PacketError::TruncatedDatagram(len))
            );
        }
        assert_eq!(rx.stats().snapshot().dropped_truncated, OUTER_HEADER_LEN as u64);
    }

    #[test]
    fn test_checksum_mismatch_dropped() {
        let tx = encapsulator(local_peer());
        let rx = encapsulator(remote_peer());
        let mut outer = tx.encapsulate(&sample_inner()).unwrap().to_vec();
        outer[8] = 64; // rewrite TTL without fixing the checksum

        assert!(matches!(
            rx.decapsulate(&outer),
            Err(PacketError::ChecksumMismatch { .. })
        ));
        assert_eq!(rx.stats().snapshot().dropped_checksum, 1);
    }

    /// Rewrite a header field and repair the checksum
    fn patch(outer: &mut [u8], offset: usize, value: u8) {
        outer[offset] = value;
        outer[10..12].fill(0);
        let sum = checksum16(&outer[..OUTER_HEADER_LEN]);
        outer[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    #[test]
    fn test_protocol_mismatch_dropped() {
        let tx = encapsulator(local_peer());
        let rx = encapsulator(remote_peer());
        let mut outer = tx.encapsulate(&sample_inner()).unwrap().to_vec();
        patch(&mut outer, 9, 254);
        assert!(OuterHeader::parse(&outer).unwrap().checksum_valid());

        assert_eq!(
            rx.decapsulate(&outer),
            Err(PacketError::ProtocolMismatch {
                protocol: 254,
                destination: Ipv4Addr::new(192, 241, 228, 123)
            })
        );
        let snap = rx.stats().snapshot();
        assert_eq!(snap.dropped_protocol, 1);
        assert_eq!(snap.rx_packets, 0);
    }

    #[test]
    fn test_wrong_destination_dropped() {
        let tx = encapsulator(local_peer());
        // Sender's own config does not match as a receiver
        let outer = tx.encapsulate(&sample_inner()).unwrap();
        assert!(matches!(
            tx.decapsulate(&outer),
            Err(PacketError::ProtocolMismatch { protocol: 253, .. })
        ));
    }

    #[test]
    fn test_malformed_header_dropped() {
        let tx = encapsulator(local_peer());
        let rx = encapsulator(remote_peer());
        let outer = tx.encapsulate(&sample_inner()).unwrap().to_vec();

        let mut bad_version = outer.clone();
        patch(&mut bad_version, 0, 0x65);
        assert!(matches!(
            rx.decapsulate(&bad_version),
            Err(PacketError::MalformedHeader(_))
        ));

        // Claimed length longer than what arrived
        let short = &outer[..outer.len() - 1];
        assert!(matches!(rx.decapsulate(short), Err(PacketError::MalformedHeader(_))));
        assert_eq!(rx.stats().snapshot().dropped_malformed, 2);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let tx = encapsulator(local_peer());
        let rx = encapsulator(remote_peer());
        let mut outer = tx.encapsulate(&sample_inner()).unwrap().to_vec();
        outer.extend_from_slice(&[0xee; 7]);
        assert_eq!(&rx.decapsulate(&outer).unwrap()[..], &sample_inner()[..]);
    }

    #[test]
    fn test_corrupt_ciphertext_counted() {
        let tx = encapsulator(local_peer());
        let rx = encapsulator(remote_peer());
        let outer = tx.encapsulate(&sample_inner()).unwrap().to_vec();

        // Drop one ciphertext byte and fix up the header so only the payload is wrong
        let mut cut = outer[..outer.len() - 1].to_vec();
        let total = (cut.len() as u16).to_be_bytes();
        cut[2] = total[0];
        patch(&mut cut, 3, total[1]);

        assert_eq!(rx.decapsulate(&cut), Err(PacketError::CorruptCiphertext));
        assert_eq!(rx.stats().snapshot().dropped_corrupt, 1);
    }

    #[test]
    fn test_mismatched_suite_rejected() {
        let codec = Codec::new(CipherSuite::ChaCha20Poly1305, KeyMaterial::generate(32)).unwrap();
        assert!(Encapsulator::new(local_peer(), codec).is_err());
        assert_eq!(
            CipherSuite::AesCbc.check_key_len(5),
            Err(CodecError::InvalidKeyLength { len: 5, suite: "aes-cbc" })
        );
    }
}
