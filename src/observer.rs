//! The node's event surface: every externally-visible occurrence the core
//! reports, logged the way each callback here reports it and forwarded to
//! whatever collaborator embeds this runtime.

use codec::address::{Protocol, RemoteAddress};
use codec::identifier::Identifier;

/// The cause attached to a `runtime_stopped` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStopCause {
    ShutdownRequested,
    Error,
}

/// Every externally-visible occurrence a subscriber might care about, each
/// carrying the data it needs without forcing it to go dig through the
/// peer/endpoint state itself.
#[derive(Debug, Clone)]
pub enum Event {
    BindingFailed { protocol: Protocol, uri: String, cause: String },
    ConnectionFailed { protocol: Protocol, uri: String, cause: String },
    EndpointStarted { protocol: Protocol, uri: String },
    EndpointStopped { protocol: Protocol, uri: String },
    PeerConnected { identifier: Identifier },
    PeerDisconnected { identifier: Identifier, cause: String },
    RuntimeStarted,
    RuntimeStopped { cause: RuntimeStopCause },
}

/// Implemented by whatever embeds this runtime.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// The default observer: logs every event at the granularity the workspace
/// uses for connection accept/teardown and handshake outcomes, and nothing
/// else. Embedders that need to forward events elsewhere wrap or replace
/// this with their own `Observer`.
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_event(&self, event: &Event) {
        match event {
            Event::BindingFailed { protocol, uri, cause } => {
                log::error!("binding failed: {protocol:?} {uri}: {cause}");
            }
            Event::ConnectionFailed { protocol, uri, cause } => {
                log::warn!("connection failed: {protocol:?} {uri}: {cause}");
            }
            Event::EndpointStarted { protocol, uri } => {
                log::info!("endpoint started: {protocol:?} {uri}");
            }
            Event::EndpointStopped { protocol, uri } => {
                log::info!("endpoint stopped: {protocol:?} {uri}");
            }
            Event::PeerConnected { identifier } => {
                log::info!("peer connected: {identifier}");
            }
            Event::PeerDisconnected { identifier, cause } => {
                log::info!("peer disconnected: {identifier}: {cause}");
            }
            Event::RuntimeStarted => {
                log::info!("runtime started");
            }
            Event::RuntimeStopped { cause } => {
                log::info!("runtime stopped: {cause:?}");
            }
        }
    }
}

pub fn binding_failed(address: &RemoteAddress, cause: impl Into<String>) -> Event {
    Event::BindingFailed {
        protocol: address.protocol(),
        uri: address.to_string(),
        cause: cause.into(),
    }
}

pub fn connection_failed(address: &RemoteAddress, cause: impl Into<String>) -> Event {
    Event::ConnectionFailed {
        protocol: address.protocol(),
        uri: address.to_string(),
        cause: cause.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_observer_does_not_panic_on_every_variant() {
        let observer = LoggingObserver;
        let address = RemoteAddress::parse("127.0.0.1:9000").unwrap();

        observer.on_event(&binding_failed(&address, "address in use"));
        observer.on_event(&connection_failed(&address, "refused"));
        observer.on_event(&Event::EndpointStarted { protocol: Protocol::Tcp, uri: address.to_string() });
        observer.on_event(&Event::EndpointStopped { protocol: Protocol::Tcp, uri: address.to_string() });
        observer.on_event(&Event::PeerConnected { identifier: Identifier::generate() });
        observer.on_event(&Event::PeerDisconnected {
            identifier: Identifier::generate(),
            cause: "session-closed".to_string(),
        });
        observer.on_event(&Event::RuntimeStarted);
        observer.on_event(&Event::RuntimeStopped { cause: RuntimeStopCause::ShutdownRequested });
    }
}
