//! Peer lifecycle, the security mediator, the awaitable tracking service,
//! and request routing: everything a node needs once bytes have been
//! decoded off an endpoint and before they go back out another one.

pub mod awaitable;
pub mod manager;
pub mod peer;
pub mod routing;
pub mod security;

pub use awaitable::{AwaitableTrackingService, CompletedTracker, ProcessOutcome, RequestKind, TrackerState};
pub use manager::{IterationControl, OptionalRequest, PeerFilter, PeerManager, PeerObserver, ProxyStateChange};
pub use peer::{EndpointRegistration, MessageContext, PeerProxy, Receiver, SendClosure, Statistics};
pub use routing::{DispatchError, Next, RouteHandler, Router};
pub use security::{HandshakeError, MediatorState, SecurityMediator, SessionKeys};

use std::sync::Arc;

use codec::identifier::Identifier;

/// Bundles the peer directory, router, and awaitable tracker behind a single
/// handle, mirroring how the core thread owns and schedules all three.
pub struct Service {
    pub peers: Arc<PeerManager>,
    pub router: Arc<Router>,
    pub awaitable: Arc<AwaitableTrackingService>,
}

impl Service {
    pub fn new(local_identifier: Identifier) -> Self {
        Self {
            peers: Arc::new(PeerManager::new(local_identifier)),
            router: Arc::new(Router::new(local_identifier)),
            awaitable: Arc::new(AwaitableTrackingService::new()),
        }
    }

    /// Same as `new`, sizing every peer's replay window from the node's
    /// configuration rather than the built-in default.
    pub fn with_replay_window(local_identifier: Identifier, replay_window: usize) -> Self {
        Self {
            peers: Arc::new(PeerManager::with_replay_window(local_identifier, replay_window)),
            router: Arc::new(Router::new(local_identifier)),
            awaitable: Arc::new(AwaitableTrackingService::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_bundles_fresh_collaborators() {
        let service = Service::new(Identifier::generate());
        assert_eq!(service.peers.observed_peers(), 0);
        assert_eq!(service.awaitable.pending_count(), 0);
    }
}
