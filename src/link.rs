//! Link-creation attributes
//!
//! The kernel-style way to bring up a tunnel is a set of optional link
//! attributes (underlying link, endpoints, TTL, TOS, PMTU discovery and the
//! UDP encapsulation knobs). [`LinkAttributes::resolve`] turns them into the
//! same [`PeerConfig`] the daemon builds from its TOML file, and
//! [`LinkAttributes::describe`] reports a running tunnel back in attribute form.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::codec::CipherSuite;
use crate::config::{PeerConfig, DEFAULT_PROTOCOL, DEFAULT_TTL};
use crate::error::{Error, Result};

/// Outer encapsulation requested for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncapType {
    /// Plain IP-in-IP
    #[default]
    None,
    /// Foo-over-UDP
    Fou,
    /// Generic UDP encapsulation
    Gue,
}

impl EncapType {
    /// Decode the numeric attribute value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(EncapType::None),
            1 => Some(EncapType::Fou),
            2 => Some(EncapType::Gue),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            EncapType::None => 0,
            EncapType::Fou => 1,
            EncapType::Gue => 2,
        }
    }
}

/// Attributes supplied when a tunnel link is created or changed.
/// Absent fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttributes {
    /// Index of the underlying device to bind to
    pub link: Option<u32>,
    pub local: Option<Ipv4Addr>,
    pub remote: Option<Ipv4Addr>,
    /// 0 means "use the default"
    pub ttl: Option<u8>,
    pub tos: Option<u8>,
    /// Non-zero enables path MTU discovery (DF bit on outer datagrams)
    pub pmtudisc: Option<u8>,
    pub encap_type: Option<u16>,
    pub encap_flags: Option<u16>,
    pub encap_sport: Option<u16>,
    pub encap_dport: Option<u16>,
    /// Outer MTU ceiling
    pub mtu: Option<usize>,
    /// Protocol number carried in the outer header
    pub protocol: Option<u8>,
}

/// Validated link parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLink {
    pub peer: PeerConfig,
    pub underlying_link: Option<u32>,
}

impl LinkAttributes {
    /// Apply the link rules and produce a peer configuration for `cipher`
    pub fn resolve(&self, cipher: CipherSuite) -> Result<ResolvedLink> {
        let remote = match self.remote {
            Some(addr) if !addr.is_unspecified() => addr,
            Some(_) => return Err(Error::LinkAttributes("remote address cannot be 0.0.0.0".into())),
            None => return Err(Error::LinkAttributes("remote address is required".into())),
        };
        let local = self
            .local
            .ok_or_else(|| Error::LinkAttributes("local address is required".into()))?;

        let encap_raw = self.encap_type.unwrap_or(0);
        match EncapType::from_u16(encap_raw) {
            Some(EncapType::None) => {}
            Some(other) => {
                return Err(Error::LinkAttributes(format!(
                    "encapsulation {:?} is not supported",
                    other
                )))
            }
            None => {
                return Err(Error::LinkAttributes(format!(
                    "unknown encapsulation type {}",
                    encap_raw
                )))
            }
        }
        let stray = [
            ("encap_flags", self.encap_flags),
            ("encap_sport", self.encap_sport),
            ("encap_dport", self.encap_dport),
        ];
        if let Some((name, _)) = stray.iter().find(|(_, v)| v.unwrap_or(0) != 0) {
            return Err(Error::LinkAttributes(format!(
                "{} must be 0 without UDP encapsulation",
                name
            )));
        }

        let ttl = match self.ttl.unwrap_or(0) {
            0 => DEFAULT_TTL,
            ttl => ttl,
        };

        let defaults = PeerConfig::default();
        let peer = PeerConfig {
            local_address: local,
            remote_address: remote,
            protocol: self.protocol.unwrap_or(DEFAULT_PROTOCOL),
            ttl,
            tos: self.tos.unwrap_or(0),
            pmtu_discovery: self.pmtudisc.unwrap_or(0) != 0,
            outer_mtu: self.mtu.unwrap_or(defaults.outer_mtu),
            cipher,
        };
        peer.validate().map_err(|e| Error::LinkAttributes(e.to_string()))?;

        Ok(ResolvedLink {
            peer,
            underlying_link: self.link.filter(|&idx| idx != 0),
        })
    }

    /// Report a tunnel's parameters in attribute form
    pub fn describe(peer: &PeerConfig, underlying_link: Option<u32>) -> Self {
        Self {
            link: Some(underlying_link.unwrap_or(0)),
            local: Some(peer.local_address),
            remote: Some(peer.remote_address),
            ttl: Some(peer.ttl),
            tos: Some(peer.tos),
            pmtudisc: Some(u8::from(peer.pmtu_discovery)),
            encap_type: Some(EncapType::None.as_u16()),
            encap_flags: Some(0),
            encap_sport: Some(0),
            encap_dport: Some(0),
            mtu: Some(peer.outer_mtu),
            protocol: Some(peer.protocol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> LinkAttributes {
        LinkAttributes {
            local: Some(Ipv4Addr::new(172, 17, 2, 250)),
            remote: Some(Ipv4Addr::new(192, 241, 228, 123)),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let resolved = attrs().resolve(CipherSuite::AesCbc).unwrap();
        assert_eq!(resolved.peer.protocol, 253);
        assert_eq!(resolved.peer.ttl, 255);
        assert_eq!(resolved.peer.tos, 0);
        assert!(!resolved.peer.pmtu_discovery);
        assert_eq!(resolved.peer.outer_mtu, 1500);
        assert_eq!(resolved.underlying_link, None);
    }

    #[test]
    fn test_ttl_zero_means_default() {
        let a = LinkAttributes {
            ttl: Some(0),
            pmtudisc: Some(1),
            ..attrs()
        };
        let peer = a.resolve(CipherSuite::AesCbc).unwrap().peer;
        assert_eq!(peer.ttl, 255);
        assert!(peer.pmtu_discovery);

        let a = LinkAttributes { ttl: Some(64), ..attrs() };
        assert_eq!(a.resolve(CipherSuite::AesCbc).unwrap().peer.ttl, 64);
    }

    #[test]
    fn test_endpoints_required() {
        let no_remote = LinkAttributes { remote: None, ..attrs() };
        assert!(matches!(
            no_remote.resolve(CipherSuite::AesCbc),
            Err(Error::LinkAttributes(_))
        ));

        let any_remote = LinkAttributes {
            remote: Some(Ipv4Addr::UNSPECIFIED),
            ..attrs()
        };
        assert!(any_remote.resolve(CipherSuite::AesCbc).is_err());

        let no_local = LinkAttributes { local: None, ..attrs() };
        assert!(no_local.resolve(CipherSuite::AesCbc).is_err());
    }

    #[test]
    fn test_udp_encapsulation_rejected() {
        for kind in [1u16, 2, 9] {
            let a = LinkAttributes {
                encap_type: Some(kind),
                ..attrs()
            };
            assert!(matches!(a.resolve(CipherSuite::AesCbc), Err(Error::LinkAttributes(_))));
        }

        let ports = LinkAttributes {
            encap_type: Some(0),
            encap_dport: Some(5555),
            ..attrs()
        };
        assert!(ports.resolve(CipherSuite::AesCbc).is_err());
    }

    #[test]
    fn test_describe_resolves_back() {
        let resolved = LinkAttributes {
            link: Some(3),
            tos: Some(0x10),
            ..attrs()
        }
        .resolve(CipherSuite::ChaCha20Poly1305)
        .unwrap();

        let described = LinkAttributes::describe(&resolved.peer, resolved.underlying_link);
        assert_eq!(described.link, Some(3));
        assert_eq!(described.encap_type, Some(0));
        assert_eq!(
            described.resolve(CipherSuite::ChaCha20Poly1305).unwrap(),
            resolved
        );
    }
}
