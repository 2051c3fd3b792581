//! Peer Proxy: the long-lived in-memory representation of a remote peer
//! across potentially multiple concurrent endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use codec::address::RemoteAddress;
use codec::identifier::Identifier;
use codec::parcel::SecurityCapabilities;
use parking_lot::{Mutex, RwLock};

use crate::security::SecurityMediator;

/// Implemented by whatever currently owns inbound bytes for a peer: the
/// `SecurityMediator` before authorization, the `AuthorizedProcessor`
/// (owned by the caller, e.g. the router dispatch path) after.
pub trait Receiver: Send + Sync {
    fn receive(&self, context: Arc<MessageContext>, bytes: Vec<u8>);
}

/// Per-connection metadata produced by an endpoint and attached to every
/// parcel moving through this registration. Holds the five bound capability
/// closures once the owning proxy's security mediator authorizes.
pub struct MessageContext {
    pub endpoint_id: u32,
    pub protocol: codec::address::Protocol,
    pub peer: Weak<PeerProxy>,
    capabilities: RwLock<Option<Arc<dyn SecurityCapabilities>>>,
}

impl MessageContext {
    pub fn new(endpoint_id: u32, protocol: codec::address::Protocol, peer: Weak<PeerProxy>) -> Self {
        Self {
            endpoint_id,
            protocol,
            peer,
            capabilities: RwLock::new(None),
        }
    }

    pub fn bind_capabilities(&self, capabilities: Arc<dyn SecurityCapabilities>) {
        *self.capabilities.write() = Some(capabilities);
    }

    pub fn capabilities(&self) -> Option<Arc<dyn SecurityCapabilities>> {
        self.capabilities.read().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.capabilities.read().is_some()
    }
}

/// A send closure bound by the owning endpoint: `(identifier, bytes) -> bool`.
pub type SendClosure = Arc<dyn Fn(Identifier, &[u8]) -> bool + Send + Sync>;

/// Per-(peer, endpoint) association. Exclusively owned by its Peer Proxy;
/// the endpoint holds only a weak reference back to the proxy.
pub struct EndpointRegistration {
    pub context: Arc<MessageContext>,
    pub send: SendClosure,
    pub remote_address: RemoteAddress,
}

#[derive(Debug, Default)]
pub struct Statistics {
    sent: AtomicU64,
    received: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl Statistics {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    fn record(counter: &AtomicU64, timestamp: &AtomicU64, now_ms: u64) {
        counter.fetch_add(1, Ordering::Relaxed);
        timestamp.store(now_ms, Ordering::Relaxed);
    }
}

struct NoopReceiver;
impl Receiver for NoopReceiver {
    fn receive(&self, _context: Arc<MessageContext>, _bytes: Vec<u8>) {
        log::warn!("dropped inbound bytes: no receiver installed on peer proxy");
    }
}

/// The long-lived in-memory representation of a remote peer.
pub struct PeerProxy {
    identifier: Identifier,
    statistics: Statistics,
    registrations: RwLock<AHashMap<u32, EndpointRegistration>>,
    mediator: Mutex<Option<Arc<SecurityMediator>>>,
    receiver: RwLock<Arc<dyn Receiver>>,
}

impl PeerProxy {
    pub fn new(identifier: Identifier) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            statistics: Statistics::default(),
            registrations: RwLock::new(AHashMap::with_capacity(4)),
            mediator: Mutex::new(None),
            receiver: RwLock::new(Arc::new(NoopReceiver)),
        })
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn statistics(&self) -> (u64, u64) {
        (self.statistics.sent(), self.statistics.received())
    }

    pub fn is_active(&self) -> bool {
        !self.registrations.read().is_empty()
    }

    pub fn is_authorized(&self) -> bool {
        self.mediator
            .lock()
            .as_ref()
            .map(|m| m.is_authorized())
            .unwrap_or(false)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Forward inbound bytes to the current receiver. Fails silently if the
    /// endpoint is unknown (transport asymmetry during teardown).
    pub fn schedule_receive(self: &Arc<Self>, endpoint_id: u32, bytes: Vec<u8>, now_ms: u64) {
        Statistics::record(&self.statistics.received, &self.statistics.last_activity_ms, now_ms);

        let context = {
            let registrations = self.registrations.read();
            match registrations.get(&endpoint_id) {
                Some(reg) => reg.context.clone(),
                None => return,
            }
        };

        let receiver = self.receiver.read().clone();
        receiver.receive(context, bytes);
    }

    /// Invoke the registration's send closure; returns whether it accepted.
    pub fn schedule_send(&self, endpoint_id: u32, bytes: &[u8], now_ms: u64) -> bool {
        let registrations = self.registrations.read();
        let Some(reg) = registrations.get(&endpoint_id) else {
            return false;
        };

        let accepted = (reg.send)(self.identifier, bytes);
        if accepted {
            Statistics::record(&self.statistics.sent, &self.statistics.last_activity_ms, now_ms);
        }

        accepted
    }

    /// Send over the first active registration, caller's choice otherwise.
    pub fn schedule_send_any(&self, bytes: &[u8], now_ms: u64) -> bool {
        let endpoint_id = match self.registrations.read().keys().next().copied() {
            Some(id) => id,
            None => return false,
        };

        self.schedule_send(endpoint_id, bytes, now_ms)
    }

    /// Idempotent on duplicate endpoint-id.
    pub fn register_endpoint(&self, endpoint_id: u32, registration: EndpointRegistration) {
        if let Some(mediator) = self.mediator.lock().as_ref() {
            if let Some(keys) = mediator.keys() {
                registration
                    .context
                    .bind_capabilities(keys as Arc<dyn SecurityCapabilities>);
            }
        }

        self.registrations.write().insert(endpoint_id, registration);
    }

    /// Removes the registration; the caller is responsible for emitting the
    /// disconnect event and marking the proxy inactive to its manager.
    pub fn withdraw_endpoint(&self, endpoint_id: u32) -> Option<EndpointRegistration> {
        self.registrations.write().remove(&endpoint_id)
    }

    /// Installs the mediator, re-binds all existing registrations' contexts
    /// to its capabilities if already authorized, and sets the proxy's
    /// receiver to the mediator's ingress. Called once.
    pub fn attach_security_mediator(&self, mediator: Arc<SecurityMediator>, ingress: Arc<dyn Receiver>) {
        if let Some(keys) = mediator.keys() {
            for reg in self.registrations.read().values() {
                reg.context.bind_capabilities(keys.clone() as Arc<dyn SecurityCapabilities>);
            }
        }

        *self.mediator.lock() = Some(mediator);
        *self.receiver.write() = ingress;
    }

    /// Swap the proxy's receiver, e.g. from the mediator's handshake
    /// handler to the AuthorizedProcessor once the session authorizes, and
    /// bind the derived session keys into every registration's context.
    pub fn on_authorized(&self, keys: Arc<dyn SecurityCapabilities>, processor: Arc<dyn Receiver>) {
        for reg in self.registrations.read().values() {
            reg.context.bind_capabilities(keys.clone());
        }

        *self.receiver.write() = processor;
    }

    pub fn mediator(&self) -> Option<Arc<SecurityMediator>> {
        self.mediator.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::address::Protocol;
    use std::sync::atomic::AtomicUsize;

    fn registration(proxy: &Arc<PeerProxy>, endpoint_id: u32, sent: Arc<AtomicUsize>) -> EndpointRegistration {
        EndpointRegistration {
            context: Arc::new(MessageContext::new(endpoint_id, Protocol::Tcp, Arc::downgrade(proxy))),
            send: Arc::new(move |_id, _bytes| {
                sent.fetch_add(1, Ordering::Relaxed);
                true
            }),
            remote_address: RemoteAddress::parse("127.0.0.1:9000").unwrap(),
        }
    }

    #[test]
    fn is_active_matches_registration_count() {
        let proxy = PeerProxy::new(Identifier::generate());
        assert!(!proxy.is_active());

        let sent = Arc::new(AtomicUsize::new(0));
        proxy.register_endpoint(1, registration(&proxy, 1, sent));
        assert!(proxy.is_active());
        assert_eq!(proxy.registration_count(), 1);

        proxy.withdraw_endpoint(1);
        assert!(!proxy.is_active());
    }

    #[test]
    fn schedule_send_to_unknown_endpoint_returns_false() {
        let proxy = PeerProxy::new(Identifier::generate());
        assert!(!proxy.schedule_send(99, b"hi", 0));
    }

    #[test]
    fn schedule_send_increments_statistics_on_success() {
        let proxy = PeerProxy::new(Identifier::generate());
        let sent = Arc::new(AtomicUsize::new(0));
        proxy.register_endpoint(1, registration(&proxy, 1, sent.clone()));

        assert!(proxy.schedule_send(1, b"hi", 10));
        assert_eq!(proxy.statistics().0, 1);
        assert_eq!(sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn register_endpoint_is_idempotent_on_duplicate_id() {
        let proxy = PeerProxy::new(Identifier::generate());
        let sent = Arc::new(AtomicUsize::new(0));
        proxy.register_endpoint(1, registration(&proxy, 1, sent.clone()));
        proxy.register_endpoint(1, registration(&proxy, 1, sent));
        assert_eq!(proxy.registration_count(), 1);
    }
}
