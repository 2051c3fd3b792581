//! The embedding-facing surface: route registration, ad hoc connect and
//! disconnect, fire-and-forget dispatch to one or many peers, and tracked
//! requests that resolve through a caller-supplied callback once their
//! awaitable tracker completes.

use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use codec::extension::{AwaitableExtension, Binding, Extension, StatusCode, StatusExtension};
use codec::header::DestinationType;
use codec::identifier::Identifier;
use codec::parcel::{build_application, pack};
use parking_lot::Mutex;
use service::{
    AwaitableTrackingService, CompletedTracker, IterationControl, PeerFilter, PeerManager, PeerProxy, RequestKind, TrackerState,
};

/// What a tracked request's callback receives once its tracker resolves.
pub enum RequestOutcome {
    Fulfilled(Vec<(Identifier, Vec<u8>)>),
    Expired(Vec<Identifier>),
}

pub type RequestCallback = Box<dyn FnOnce(RequestOutcome) + Send>;

/// Callbacks for requests staged directly by the embedding surface (as
/// opposed to a peer's deferred cluster request, whose completion is
/// answered back to that peer instead of a local callback).
#[derive(Default)]
pub struct PendingRequests {
    callbacks: Mutex<AHashMap<[u8; 16], RequestCallback>>,
}

impl PendingRequests {
    pub fn register(&self, key: [u8; 16], callback: RequestCallback) {
        self.callbacks.lock().insert(key, callback);
    }

    fn take(&self, key: &[u8; 16]) -> Option<RequestCallback> {
        self.callbacks.lock().remove(key)
    }
}

fn send_application(
    proxy: &Arc<PeerProxy>,
    local_identifier: Identifier,
    route: &str,
    payload: Vec<u8>,
    extensions: Vec<Box<dyn Extension + Send + Sync>>,
    now_ms: u64,
) -> bool {
    let Ok(parcel) = build_application(local_identifier, DestinationType::Node, Some(proxy.identifier()), route, payload, extensions) else {
        return false;
    };

    let capabilities = proxy.mediator().and_then(|mediator| mediator.keys());
    let Ok(bytes) = pack(&parcel.into(), capabilities.as_ref().map(|keys| keys.as_ref() as &dyn codec::parcel::SecurityCapabilities)) else {
        return false;
    };

    proxy.schedule_send_any(bytes.as_bytes(), now_ms)
}

/// Fire-and-forget send to a single identified peer.
pub fn dispatch_to(peers: &PeerManager, local_identifier: Identifier, target: Identifier, route: &str, payload: Vec<u8>, now_ms: u64) -> bool {
    let Some(proxy) = peers.get(target) else {
        return false;
    };

    send_application(&proxy, local_identifier, route, payload, Vec::new(), now_ms)
}

fn active_proxies(peers: &PeerManager) -> Vec<Arc<PeerProxy>> {
    let mut proxies = Vec::new();
    peers.for_each_peer(PeerFilter::Active, |proxy| {
        proxies.push(proxy.clone());
        IterationControl::Continue
    });
    proxies
}

/// Fire-and-forget to a fraction of active peers: `1.0` targets every active
/// peer, `0.0` targets none. The subset is the first `fraction` share of the
/// peer list in identifier order, not a random sample.
pub fn fanout_dispatch(peers: &PeerManager, local_identifier: Identifier, route: &str, payload: Vec<u8>, fraction: f64, now_ms: u64) -> usize {
    let proxies = active_proxies(peers);
    let keep = ((proxies.len() as f64) * fraction.clamp(0.0, 1.0)).round() as usize;

    proxies
        .iter()
        .take(keep)
        .filter(|proxy| send_application(proxy, local_identifier, route, payload.clone(), Vec::new(), now_ms))
        .count()
}

/// Stages a tracked request against every identifier in `targets` that
/// resolves to a live proxy, and registers `callback` to run when the
/// tracker completes (fulfilled or expired).
#[allow(clippy::too_many_arguments)]
pub fn request(
    peers: &PeerManager,
    awaitable: &Arc<AwaitableTrackingService>,
    pending: &Arc<PendingRequests>,
    local_identifier: Identifier,
    targets: &[Identifier],
    kind: RequestKind,
    route: &str,
    payload: Vec<u8>,
    timeout_ms: u64,
    now_ms: u64,
    callback: RequestCallback,
) -> bool {
    let mut expected = AHashSet::default();
    let mut proxies = Vec::with_capacity(targets.len());

    for target in targets {
        if let Some(proxy) = peers.get(*target) {
            expected.insert(*target);
            proxies.push(proxy);
        }
    }

    if proxies.is_empty() {
        return false;
    }

    let key = awaitable.stage(kind, local_identifier.as_internal(), expected, Weak::new(), now_ms, timeout_ms);
    pending.register(key, callback);

    for proxy in &proxies {
        send_application(
            proxy,
            local_identifier,
            route,
            payload.clone(),
            vec![Box::new(AwaitableExtension { binding: Binding::Request, tracker_key: key })],
            now_ms,
        );
    }

    true
}

/// Concatenates every responder's payload, newline-separated. An aggregate
/// format chosen for simplicity; callers that need structure encode it in
/// the payload itself.
fn aggregate_payload(received: &[(Identifier, codec::parcel::ApplicationParcel)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, (_, parcel)) in received.iter().enumerate() {
        if index > 0 {
            out.push(b'\n');
        }
        out.extend_from_slice(&parcel.payload);
    }
    out
}

/// Drains a completed tracker: a deferred aggregate answers the peer that
/// asked for it; anything else resolves the locally registered callback.
pub fn handle_completed_tracker(pending: &PendingRequests, local_identifier: Identifier, tracker: CompletedTracker, now_ms: u64) {
    match tracker.original_requestor_parcel {
        Some(original) => {
            let Some(proxy) = tracker.requestor.upgrade() else {
                return;
            };

            let status = match tracker.state {
                TrackerState::Fulfilled => StatusCode::Ok,
                _ => StatusCode::RequestTimeout,
            };

            let mut extensions: Vec<Box<dyn Extension + Send + Sync>> = vec![Box::new(StatusExtension { code: status })];
            if let Some(awaitable) = original.extensions.awaitable() {
                if awaitable.binding == Binding::Request {
                    extensions.push(Box::new(AwaitableExtension { binding: Binding::Response, tracker_key: awaitable.tracker_key }));
                }
            }

            let payload = aggregate_payload(&tracker.received);
            send_application(&proxy, local_identifier, &original.route, payload, extensions, now_ms);
        }
        None => {
            if let Some(callback) = pending.take(&tracker.key) {
                let outcome = match tracker.state {
                    TrackerState::Fulfilled => {
                        RequestOutcome::Fulfilled(tracker.received.into_iter().map(|(id, parcel)| (id, parcel.payload)).collect())
                    }
                    _ => RequestOutcome::Expired(tracker.expected),
                };
                callback(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::PeerProxy;

    #[test]
    fn dispatch_to_unknown_peer_reports_false() {
        let peers = PeerManager::new(Identifier::generate());
        assert!(!dispatch_to(&peers, Identifier::generate(), Identifier::generate(), "/ping", Vec::new(), 0));
    }

    #[test]
    fn fanout_with_zero_fraction_sends_to_nobody() {
        let peers = PeerManager::new(Identifier::generate());
        let proxy = PeerProxy::new(Identifier::generate());
        peers.link_peer(proxy.identifier(), &codec::address::RemoteAddress::parse("127.0.0.1:1").unwrap());
        assert_eq!(fanout_dispatch(&peers, Identifier::generate(), "/ping", Vec::new(), 0.0, 0), 0);
    }

    #[test]
    fn request_with_no_resolvable_targets_is_rejected() {
        let peers = PeerManager::new(Identifier::generate());
        let awaitable = Arc::new(AwaitableTrackingService::new());
        let pending = Arc::new(PendingRequests::default());

        let accepted = request(
            &peers,
            &awaitable,
            &pending,
            Identifier::generate(),
            &[Identifier::generate()],
            RequestKind::Direct,
            "/ping",
            Vec::new(),
            1000,
            0,
            Box::new(|_| {}),
        );

        assert!(!accepted);
    }
}
