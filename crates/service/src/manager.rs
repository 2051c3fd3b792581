//! Peer Manager: the authoritative directory of Peer Proxies. Resolves
//! addresses to proxies and routes peer state notifications to observers.

use std::sync::Arc;

use ahash::AHashMap;
use codec::address::RemoteAddress;
use codec::identifier::Identifier;
use parking_lot::RwLock;

use crate::peer::{PeerProxy, Receiver};
use crate::security::SecurityMediator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
    Active,
    Inactive,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStateChange {
    Connected,
    Disconnected,
}

pub enum IterationControl {
    Continue,
    Stop,
}

/// Fans out peer connect/disconnect notifications. Invoked synchronously on
/// the core thread from `dispatch_peer_state_change`.
pub trait PeerObserver: Send + Sync {
    fn on_state_change(&self, proxy: &Arc<PeerProxy>, endpoint_id: u32, change: ProxyStateChange);
}

pub struct OptionalRequest {
    pub handshake_bytes: String,
}

/// All peer-map mutations happen on the core thread; lookups from endpoint
/// threads use a reader-writer discipline (a shared lock per map, writes
/// exclusive), matching the concurrency model the Peer Manager promises.
pub struct PeerManager {
    local_identifier: Identifier,
    replay_window: usize,
    proxies: RwLock<AHashMap<Identifier, Arc<PeerProxy>>>,
    resolving: RwLock<AHashMap<String, Arc<SecurityMediator>>>,
    observers: RwLock<Vec<Arc<dyn PeerObserver>>>,
}

impl PeerManager {
    pub fn new(local_identifier: Identifier) -> Self {
        Self::with_replay_window(local_identifier, 256)
    }

    /// Same as `new`, sizing every mediator's replay window from the node's
    /// configuration rather than the built-in default.
    pub fn with_replay_window(local_identifier: Identifier, replay_window: usize) -> Self {
        Self {
            local_identifier,
            replay_window,
            proxies: RwLock::new(AHashMap::with_capacity(64)),
            resolving: RwLock::new(AHashMap::with_capacity(16)),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.observers.write().push(observer);
    }

    /// If `address` is already resolving, returns `None`. If `identifier` is
    /// already known with an existing proxy, emits a fast-path heartbeat
    /// request to bypass the handshake. Otherwise creates a new initiator
    /// mediator, stores it keyed by address, and returns the initial
    /// handshake bytes for the endpoint to transmit.
    pub fn declare_resolving(
        &self,
        address: &RemoteAddress,
        maybe_identifier: Option<Identifier>,
    ) -> Option<OptionalRequest> {
        let key = address.to_string();

        if self.resolving.read().contains_key(&key) {
            return None;
        }

        if let Some(identifier) = maybe_identifier {
            if let Some(proxy) = self.proxies.read().get(&identifier).cloned() {
                let parcel = codec::parcel::build_platform(
                    self.local_identifier,
                    codec::header::DestinationType::Node,
                    Some(identifier),
                    codec::parcel::PlatformType::HeartbeatRequest,
                    Vec::new(),
                )
                .ok()?;

                let capabilities = proxy.mediator().and_then(|mediator| mediator.keys());
                let bytes = codec::parcel::pack(
                    &parcel.into(),
                    capabilities.as_ref().map(|keys| keys.as_ref() as &dyn codec::parcel::SecurityCapabilities),
                )
                .ok()?;
                return Some(OptionalRequest { handshake_bytes: bytes });
            }
        }

        let mediator = Arc::new(SecurityMediator::with_replay_window(self.local_identifier, self.replay_window));
        let destination = maybe_identifier.unwrap_or(Identifier::NETWORK_REQUEST);
        let handshake_bytes = mediator.setup_initiator(destination).ok()?;

        self.resolving.write().insert(key, mediator);

        Some(OptionalRequest { handshake_bytes })
    }

    /// Removes a pending resolution (the endpoint's connection timed out).
    pub fn undeclare_resolving(&self, address: &RemoteAddress) {
        self.resolving.write().remove(&address.to_string());
    }

    /// Called by an endpoint once it has authenticated the source of an
    /// inbound stream. Moves any resolving mediator for `address` into the
    /// returned proxy; otherwise creates a fresh acceptor mediator.
    pub fn link_peer(&self, identifier: Identifier, address: &RemoteAddress) -> Arc<PeerProxy> {
        if let Some(proxy) = self.proxies.read().get(&identifier) {
            return proxy.clone();
        }

        let mediator = self
            .resolving
            .write()
            .remove(&address.to_string())
            .unwrap_or_else(|| Arc::new(SecurityMediator::with_replay_window(self.local_identifier, self.replay_window)));

        let proxy = PeerProxy::new(identifier);
        let ingress = Arc::new(HandshakeIngress {
            mediator: mediator.clone(),
        });
        proxy.attach_security_mediator(mediator, ingress);

        self.proxies.write().insert(identifier, proxy.clone());
        proxy
    }

    pub fn for_each_peer(&self, filter: PeerFilter, mut callback: impl FnMut(&Arc<PeerProxy>) -> IterationControl) {
        let mut identifiers: Vec<Identifier> = self.proxies.read().keys().copied().collect();
        identifiers.sort_by(|a, b| a.as_internal().cmp(b.as_internal()));

        let proxies = self.proxies.read();
        for identifier in identifiers {
            let Some(proxy) = proxies.get(&identifier) else {
                continue;
            };

            let matches = match filter {
                PeerFilter::All => true,
                PeerFilter::Active => proxy.is_active(),
                PeerFilter::Inactive => !proxy.is_active(),
            };

            if matches {
                if let IterationControl::Stop = callback(proxy) {
                    break;
                }
            }
        }
    }

    pub fn active_peers(&self) -> usize {
        self.proxies.read().values().filter(|p| p.is_active()).count()
    }

    pub fn inactive_peers(&self) -> usize {
        self.proxies.read().values().filter(|p| !p.is_active()).count()
    }

    pub fn observed_peers(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn resolving_peers(&self) -> usize {
        self.resolving.read().len()
    }

    pub fn active_proxies(&self) -> Vec<Arc<PeerProxy>> {
        self.proxies
            .read()
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    pub fn get(&self, identifier: Identifier) -> Option<Arc<PeerProxy>> {
        self.proxies.read().get(&identifier).cloned()
    }

    /// Fans out to registered observers synchronously on the core thread.
    pub fn dispatch_peer_state_change(&self, proxy: &Arc<PeerProxy>, endpoint_id: u32, change: ProxyStateChange) {
        for observer in self.observers.read().iter() {
            observer.on_state_change(proxy, endpoint_id, change);
        }

        if change == ProxyStateChange::Disconnected && !proxy.is_active() {
            self.proxies.write().remove(&proxy.identifier());
        }
    }
}

struct HandshakeIngress {
    mediator: Arc<SecurityMediator>,
}

impl Receiver for HandshakeIngress {
    fn receive(&self, _context: Arc<crate::peer::MessageContext>, bytes: Vec<u8>) {
        let Ok(text) = std::str::from_utf8(&bytes) else {
            self.mediator.flag();
            return;
        };

        if let Err(err) = self.mediator.on_handshake_bytes(text) {
            log::warn!("handshake failed: {err:?}");
            self.mediator.flag();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_resolving_is_idempotent_per_address() {
        let manager = PeerManager::new(Identifier::generate());
        let address = RemoteAddress::parse("127.0.0.1:4000").unwrap();

        assert!(manager.declare_resolving(&address, None).is_some());
        assert!(manager.declare_resolving(&address, None).is_none());
        assert_eq!(manager.resolving_peers(), 1);
    }

    #[test]
    fn undeclare_resolving_clears_pending_entry() {
        let manager = PeerManager::new(Identifier::generate());
        let address = RemoteAddress::parse("127.0.0.1:4001").unwrap();

        manager.declare_resolving(&address, None);
        manager.undeclare_resolving(&address);
        assert_eq!(manager.resolving_peers(), 0);
    }

    #[test]
    fn link_peer_moves_resolving_mediator_into_new_proxy() {
        let manager = PeerManager::new(Identifier::generate());
        let address = RemoteAddress::parse("127.0.0.1:4002").unwrap();
        manager.declare_resolving(&address, None);

        let identifier = Identifier::generate();
        let proxy = manager.link_peer(identifier, &address);

        assert_eq!(proxy.identifier(), identifier);
        assert_eq!(manager.resolving_peers(), 0);
        assert_eq!(manager.observed_peers(), 1);
    }

    #[test]
    fn link_peer_is_stable_across_repeated_calls() {
        let manager = PeerManager::new(Identifier::generate());
        let address = RemoteAddress::parse("127.0.0.1:4003").unwrap();
        let identifier = Identifier::generate();

        let first = manager.link_peer(identifier, &address);
        let second = manager.link_peer(identifier, &address);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn active_invariant_matches_registration_state() {
        let manager = PeerManager::new(Identifier::generate());
        let address = RemoteAddress::parse("127.0.0.1:4004").unwrap();
        manager.link_peer(Identifier::generate(), &address);

        assert_eq!(manager.active_peers(), 0);
        assert_eq!(manager.inactive_peers(), 1);
    }
}
