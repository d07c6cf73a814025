//! Per-namespace tunnel registry
//!
//! Kernel-style deployments keep one tunnel per network namespace. The
//! registry owns those instances explicitly and hands out shared
//! [`Encapsulator`]s; there is no global state. Lookups take a short read
//! lock and never sleep, so the receive and transmit hooks can be called
//! per packet.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tracing::{debug, info};

use crate::codec::{CipherSuite, Codec, KeyMaterial};
use crate::config::PeerConfig;
use crate::encap::Encapsulator;
use crate::error::{Error, Result};
use crate::link::LinkAttributes;

/// Network namespace identifier
pub type NamespaceId = u64;

/// Tunnel instances keyed by namespace
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<NamespaceId, Arc<Encapsulator>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are only ever replaced whole, so a poisoned map is still consistent
    fn read(&self) -> RwLockReadGuard<'_, HashMap<NamespaceId, Arc<Encapsulator>>> {
        self.tunnels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NamespaceId, Arc<Encapsulator>>> {
        self.tunnels.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build and register the tunnel for `ns`
    pub fn create(&self, ns: NamespaceId, peer: PeerConfig, key: KeyMaterial) -> Result<Arc<Encapsulator>> {
        let codec = Codec::new(peer.cipher, key)?;
        self.insert(ns, Encapsulator::new(peer, codec)?)
    }

    /// Create the tunnel for `ns` from link attributes
    pub fn create_from_link(
        &self,
        ns: NamespaceId,
        attrs: &LinkAttributes,
        cipher: CipherSuite,
        key: KeyMaterial,
    ) -> Result<Arc<Encapsulator>> {
        let resolved = attrs.resolve(cipher)?;
        self.create(ns, resolved.peer, key)
    }

    /// Register an already built encapsulator
    pub fn insert(&self, ns: NamespaceId, encap: Encapsulator) -> Result<Arc<Encapsulator>> {
        let mut tunnels = self.write();
        if tunnels.contains_key(&ns) {
            return Err(Error::TunnelExists(ns));
        }
        let encap = Arc::new(encap);
        info!(
            "Tunnel registered for namespace {}: {} -> {}",
            ns,
            encap.peer().local_address,
            encap.peer().remote_address
        );
        tunnels.insert(ns, encap.clone());
        Ok(encap)
    }

    /// Replace the parameters of an existing tunnel. Counters carry over;
    /// holders of the previous instance keep using it until they drop it.
    pub fn change_link(
        &self,
        ns: NamespaceId,
        attrs: &LinkAttributes,
        key: KeyMaterial,
    ) -> Result<Arc<Encapsulator>> {
        let mut tunnels = self.write();
        let current = tunnels.get(&ns).ok_or(Error::TunnelNotFound(ns))?;
        let resolved = attrs.resolve(current.peer().cipher)?;
        let codec = Codec::new(resolved.peer.cipher, key)?;
        let stats = current.stats().clone();
        let encap = Arc::new(Encapsulator::with_stats(resolved.peer, codec, stats)?);
        tunnels.insert(ns, encap.clone());
        info!("Tunnel for namespace {} changed", ns);
        Ok(encap)
    }

    pub fn get(&self, ns: NamespaceId) -> Option<Arc<Encapsulator>> {
        self.read().get(&ns).cloned()
    }

    /// Unregister the tunnel for `ns`
    pub fn remove(&self, ns: NamespaceId) -> Result<Arc<Encapsulator>> {
        let removed = self.write().remove(&ns).ok_or(Error::TunnelNotFound(ns))?;
        info!("Tunnel for namespace {} removed", ns);
        Ok(removed)
    }

    pub fn namespaces(&self) -> Vec<NamespaceId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every registered tunnel, returning how many there were
    pub fn teardown(&self) -> usize {
        let count = {
            let mut tunnels = self.write();
            let count = tunnels.len();
            tunnels.clear();
            count
        };
        if count > 0 {
            info!("Tore down {} tunnel(s)", count);
        }
        count
    }

    /// Receive hook: decapsulate a datagram that arrived in `ns`.
    /// `None` means it is not ours or was dropped (and counted).
    pub fn receive(&self, ns: NamespaceId, datagram: &[u8]) -> Option<Bytes> {
        let encap = self.get(ns)?;
        match encap.decapsulate(datagram) {
            Ok(inner) => Some(inner),
            Err(e) => {
                debug!("Namespace {}: dropped datagram: {}", ns, e);
                None
            }
        }
    }

    /// Transmit hook: encapsulate an inner packet leaving through the tunnel in `ns`
    pub fn transmit(&self, ns: NamespaceId, inner: &[u8]) -> Option<Bytes> {
        let encap = self.get(ns)?;
        match encap.encapsulate(inner) {
            Ok(outer) => Some(outer),
            Err(e) => {
                debug!("Namespace {}: dropped packet: {}", ns, e);
                None
            }
        }
    }
}
