//! eipip - Encrypted personal-use IP-in-IP tunnel
//!
//! Inner IP packets read from a TUN interface are encrypted and carried as
//! the payload of outer IPv4 datagrams using a private protocol number
//! (253 by default), sent over a raw socket to a fixed peer.
//!
//! # Architecture
//!
//! The [`encap::Encapsulator`] is the core: it combines the symmetric
//! [`codec`] with outer [`header`] construction and validation. It is pure
//! logic with no I/O, locks or sleeping, so it serves both the user-space
//! [`dispatcher`] (TUN device plus raw socket on tokio) and the per-packet
//! hooks of the namespace-keyed [`registry`].
//!
//! # Features
//!
//! - AES-CBC (128/192/256) or ChaCha20-Poly1305 payload encryption
//! - RFC 1071 header checksums, protocol and destination filtering
//! - MTU budgeting so outer datagrams never exceed the configured ceiling
//! - Lock-free packet, byte and drop counters with a JSON status report
//! - Kernel-style link attributes and per-namespace tunnel registry

pub mod checksum;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod encap;
pub mod error;
pub mod header;
pub mod link;
pub mod registry;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::{CipherSuite, Codec, KeyMaterial};
    pub use crate::config::{Config, PeerConfig};
    pub use crate::dispatcher::{Dispatcher, DispatcherSettings, DispatcherState, StopReason};
    pub use crate::encap::Encapsulator;
    pub use crate::error::{Error, PacketError, Result};
    pub use crate::registry::{NamespaceId, TunnelRegistry};
    pub use crate::transport::PacketEndpoint;
}
