//! The authorized receiver installed on a Peer Proxy once its session
//! reaches `Authorized`: decrypts and verifies inbound bytes, then either
//! resolves an awaitable tracker or dispatches into the route table.

use std::sync::Arc;

use codec::header::DestinationType;
use codec::identifier::Identifier;
use codec::parcel::{PlatformType, build_platform, pack, unpack, Parcel};
use service::{AwaitableTrackingService, MessageContext, PeerProxy, Receiver, Router};

pub struct AuthorizedProcessor {
    local_identifier: Identifier,
    router: Arc<Router>,
    awaitable: Arc<AwaitableTrackingService>,
}

impl AuthorizedProcessor {
    pub fn new(local_identifier: Identifier, router: Arc<Router>, awaitable: Arc<AwaitableTrackingService>) -> Self {
        Self { local_identifier, router, awaitable }
    }
}

impl Receiver for AuthorizedProcessor {
    fn receive(&self, context: Arc<MessageContext>, bytes: Vec<u8>) {
        let Some(capabilities) = context.capabilities() else {
            log::warn!("authorized processor invoked with no bound capabilities");
            return;
        };

        let Ok(text) = std::str::from_utf8(&bytes) else {
            log::debug!("dropped non-utf8 frame from {:?}", context.peer.upgrade().map(|p| p.identifier()));
            return;
        };

        let parcel = match unpack(text, Some(capabilities.as_ref())) {
            Ok(parcel) => parcel,
            Err(err) => {
                log::debug!("dropped malformed parcel: {err:?}");
                return;
            }
        };

        let Some(proxy) = context.peer.upgrade() else {
            return;
        };

        let now_ms = crate::now_ms();

        match parcel {
            Parcel::Application(application) => {
                let is_response = application
                    .extensions
                    .awaitable()
                    .map(|ext| ext.binding == codec::extension::Binding::Response)
                    .unwrap_or(false);

                if is_response {
                    self.awaitable.process(application.header.source, application);
                    return;
                }

                if let Err(err) = self.router.dispatch(&application, std::sync::Arc::downgrade(&proxy), self.awaitable.clone(), now_ms) {
                    log::debug!("unrouted application parcel: {err:?}");
                }
            }
            Parcel::Platform(platform) => {
                self.handle_platform(&proxy, platform, capabilities.as_ref(), now_ms)
            }
        }
    }
}

impl AuthorizedProcessor {
    fn handle_platform(
        &self,
        proxy: &Arc<PeerProxy>,
        platform: codec::parcel::PlatformParcel,
        capabilities: &dyn codec::parcel::SecurityCapabilities,
        now_ms: u64,
    ) {
        if platform.platform_type != PlatformType::HeartbeatRequest {
            return;
        }

        let Ok(response) = build_platform(
            self.local_identifier,
            DestinationType::Node,
            Some(platform.header.source),
            PlatformType::HeartbeatResponse,
            Vec::new(),
        ) else {
            return;
        };

        if let Ok(bytes) = pack(&response.into(), Some(capabilities)) {
            proxy.schedule_send_any(bytes.as_bytes(), now_ms);
        }
    }
}
