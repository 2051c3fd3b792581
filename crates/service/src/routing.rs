//! Router: a string-keyed route table plus the `Next` continuation handed to
//! route handlers for responding, forwarding, or deferring a request.

use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use codec::Error as CodecError;
use codec::extension::{AwaitableExtension, Binding, StatusCode, StatusExtension};
use codec::header::DestinationType;
use codec::identifier::Identifier;
use codec::parcel::{ApplicationParcel, build_application, pack};
use parking_lot::RwLock;

use crate::awaitable::AwaitableTrackingService;
use crate::peer::PeerProxy;

/// Implemented per route. Runs synchronously on the core thread; long work
/// belongs behind `next.defer(..)`, not inline. The boolean return is the
/// handler's acceptance signal: `false` routes back through `next` as a
/// `bad-request` status response when the request carried an Awaitable
/// extension.
pub trait RouteHandler: Send + Sync {
    fn handle(&self, source: Identifier, payload: &[u8], next: &Next) -> bool;
}

/// The continuation passed to a route handler: where the request came from,
/// the route it arrived on, and what it may still do with it.
pub struct Next {
    local_identifier: Identifier,
    route: String,
    source: Identifier,
    requestor: Weak<PeerProxy>,
    request_awaitable: Option<AwaitableExtension>,
    awaitable_service: Arc<AwaitableTrackingService>,
    now_ms: u64,
}

impl Next {
    fn new(
        local_identifier: Identifier,
        route: String,
        source: Identifier,
        requestor: Weak<PeerProxy>,
        request_awaitable: Option<AwaitableExtension>,
        awaitable_service: Arc<AwaitableTrackingService>,
        now_ms: u64,
    ) -> Self {
        Self {
            local_identifier,
            route,
            source,
            requestor,
            request_awaitable,
            awaitable_service,
            now_ms,
        }
    }

    fn send(&self, parcel: ApplicationParcel) -> Result<(), CodecError> {
        let Some(proxy) = self.requestor.upgrade() else {
            return Err(CodecError::InvalidSource);
        };

        let capabilities = proxy.mediator().and_then(|mediator| mediator.keys());
        let bytes = pack(&parcel.into(), capabilities.as_ref().map(|keys| keys.as_ref() as &dyn codec::parcel::SecurityCapabilities))?;

        if !proxy.schedule_send_any(bytes.as_bytes(), self.now_ms) {
            return Err(CodecError::InvalidSource);
        }

        Ok(())
    }

    /// Fire-and-forget send to the original source, over the same route.
    pub fn dispatch(&self, route: &str, payload: Vec<u8>) -> Result<(), CodecError> {
        let parcel = build_application(
            self.local_identifier,
            DestinationType::Node,
            Some(self.source),
            route,
            payload,
            Vec::new(),
        )?;

        self.send(parcel)
    }

    /// Sends a response bound with the request's Awaitable tracker key (as a
    /// response-bound extension, when the request carried one) and a Status
    /// extension carrying `status`.
    pub fn respond(&self, payload: Vec<u8>, status: StatusCode) -> Result<(), CodecError> {
        let mut extensions: Vec<Box<dyn codec::extension::Extension + Send + Sync>> =
            vec![Box::new(StatusExtension { code: status })];

        if let Some(awaitable) = &self.request_awaitable {
            if awaitable.binding == Binding::Request {
                extensions.push(Box::new(AwaitableExtension {
                    binding: Binding::Response,
                    tracker_key: awaitable.tracker_key,
                }));
            }
        }

        let parcel = build_application(
            self.local_identifier,
            DestinationType::Node,
            Some(self.source),
            &self.route,
            payload,
            extensions,
        )?;

        self.send(parcel)
    }

    /// Stages a deferred aggregate tracker and dispatches the inner request,
    /// carrying the new tracker's Request-bound Awaitable extension, to
    /// every expected peer.
    pub fn defer(
        &self,
        expected: Vec<(Identifier, Arc<PeerProxy>)>,
        inner_route: &str,
        inner_payload: Vec<u8>,
        timeout_ms: u64,
    ) -> Result<[u8; 16], CodecError> {
        let deferred_parcel = build_application(
            self.local_identifier,
            DestinationType::Node,
            Some(self.source),
            &self.route,
            Vec::new(),
            self.request_awaitable
                .clone()
                .into_iter()
                .map(|ext| Box::new(ext) as Box<dyn codec::extension::Extension + Send + Sync>)
                .collect(),
        )?;

        let expected_ids: AHashSet<Identifier> = expected.iter().map(|(id, _)| *id).collect();

        let key = self
            .awaitable_service
            .stage_deferred(
                self.local_identifier.as_internal(),
                expected_ids,
                deferred_parcel,
                self.requestor.clone(),
                self.now_ms,
                timeout_ms,
            )
            .ok_or(CodecError::InvalidArgument)?;

        for (_, proxy) in &expected {
            let inner = build_application(
                self.local_identifier,
                DestinationType::Node,
                Some(proxy.identifier()),
                inner_route,
                inner_payload.clone(),
                vec![Box::new(AwaitableExtension {
                    binding: Binding::Request,
                    tracker_key: key,
                })],
            )?;

            let capabilities = proxy.mediator().and_then(|mediator| mediator.keys());
            if let Ok(bytes) = pack(&inner.into(), capabilities.as_ref().map(|keys| keys.as_ref() as &dyn codec::parcel::SecurityCapabilities)) {
                proxy.schedule_send_any(bytes.as_bytes(), self.now_ms);
            }
        }

        Ok(key)
    }

    /// True if this request expects a correlated response (carries a
    /// Request-bound Awaitable extension).
    pub fn expects_response(&self) -> bool {
        matches!(
            &self.request_awaitable,
            Some(awaitable) if awaitable.binding == Binding::Request
        )
    }

    pub fn source(&self) -> Identifier {
        self.source
    }
}

/// String-keyed route table. Unknown routes are reported to the caller of
/// `dispatch` rather than silently dropped.
pub struct Router {
    local_identifier: Identifier,
    handlers: RwLock<AHashMap<String, Arc<dyn RouteHandler>>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchError {
    UnknownRoute,
}

impl Router {
    pub fn new(local_identifier: Identifier) -> Self {
        Self {
            local_identifier,
            handlers: RwLock::new(AHashMap::with_capacity(16)),
        }
    }

    pub fn register(&self, route: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        self.handlers.write().insert(route.into(), handler);
    }

    pub fn is_registered(&self, route: &str) -> bool {
        self.handlers.read().contains_key(route)
    }

    /// Looks up the handler for `parcel.route` and invokes it with a fresh
    /// `Next` bound to the requesting peer. A handler returning `false`
    /// routes back through `next` as a `bad-request` status response when
    /// the request carried an Awaitable extension.
    pub fn dispatch(
        &self,
        parcel: &ApplicationParcel,
        requestor: Weak<PeerProxy>,
        awaitable_service: Arc<AwaitableTrackingService>,
        now_ms: u64,
    ) -> Result<(), DispatchError> {
        let handler = {
            let handlers = self.handlers.read();
            handlers.get(&parcel.route).cloned()
        };

        let Some(handler) = handler else {
            return Err(DispatchError::UnknownRoute);
        };

        let next = Next::new(
            self.local_identifier,
            parcel.route.clone(),
            parcel.header.source,
            requestor,
            parcel.extensions.awaitable().cloned(),
            awaitable_service,
            now_ms,
        );

        let accepted = handler.handle(parcel.header.source, &parcel.payload, &next);
        if !accepted && next.expects_response() {
            let _ = next.respond(Vec::new(), StatusCode::BadRequest);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::extension::AwaitableExtension;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler {
        calls: Arc<AtomicUsize>,
    }

    impl RouteHandler for EchoHandler {
        fn handle(&self, _source: Identifier, payload: &[u8], next: &Next) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let _ = next.respond(payload.to_vec(), StatusCode::Ok);
            true
        }
    }

    struct RejectingHandler;
    impl RouteHandler for RejectingHandler {
        fn handle(&self, _source: Identifier, _payload: &[u8], _next: &Next) -> bool {
            false
        }
    }

    fn request_parcel(route: &str, awaitable: Option<AwaitableExtension>) -> ApplicationParcel {
        let mut extensions: Vec<Box<dyn codec::extension::Extension + Send + Sync>> = Vec::new();
        if let Some(ext) = awaitable {
            extensions.push(Box::new(ext));
        }

        build_application(
            Identifier::generate(),
            DestinationType::Node,
            None,
            route,
            b"ping".to_vec(),
            extensions,
        )
        .unwrap()
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let router = Router::new(Identifier::generate());
        let calls = Arc::new(AtomicUsize::new(0));
        router.register("/echo", Arc::new(EchoHandler { calls: calls.clone() }));

        let parcel = request_parcel("/echo", None);
        let proxy = PeerProxy::new(Identifier::generate());
        let awaitable = Arc::new(AwaitableTrackingService::new());

        router
            .dispatch(&parcel, Arc::downgrade(&proxy), awaitable, 0)
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dispatch_reports_unknown_route() {
        let router = Router::new(Identifier::generate());
        let parcel = request_parcel("/missing", None);
        let proxy = PeerProxy::new(Identifier::generate());
        let awaitable = Arc::new(AwaitableTrackingService::new());

        let result = router.dispatch(&parcel, Arc::downgrade(&proxy), awaitable, 0);
        assert_eq!(result, Err(DispatchError::UnknownRoute));
    }

    #[test]
    fn rejected_request_with_awaitable_extension_yields_bad_request_response() {
        let router = Router::new(Identifier::generate());
        router.register("/reject", Arc::new(RejectingHandler));

        let awaitable_ext = AwaitableExtension {
            binding: Binding::Request,
            tracker_key: [3u8; 16],
        };
        let parcel = request_parcel("/reject", Some(awaitable_ext));
        let proxy = PeerProxy::new(Identifier::generate());
        let awaitable = Arc::new(AwaitableTrackingService::new());

        // No active registration on the proxy, so the auto bad-request
        // response fails to send, but dispatch() itself must still
        // succeed: a handler's rejection is not a routing failure.
        let result = router.dispatch(&parcel, Arc::downgrade(&proxy), awaitable, 0);
        assert!(result.is_ok());
    }
}
