//! Network Manager: owns the node's fleet of endpoints, keyed by protocol,
//! and drives bootstrap dialing on startup.

use std::sync::Arc;
use std::time::Duration;

use codec::address::RemoteAddress;
use codec::identifier::Identifier;

use crate::config::{BootstrapEntry, Config, EndpointBinding};
use crate::endpoint::TcpEndpoint;
use crate::observer::{self, Observer};
use crate::processor::AuthorizedProcessor;
use crate::statistics::NodeStatistics;

/// Only `tcp` has a concrete transport today; other protocol names parse
/// fine as addresses but have nothing to bind or dial them with yet.
const SUPPORTED_PROTOCOL: &str = "tcp";

fn parse_bootstrap_address(text: &str) -> Result<RemoteAddress, codec::Error> {
    let parsed = RemoteAddress::parse(text)?;
    RemoteAddress::with_bootstrap(parsed.protocol(), parsed.authority(), true)
}

pub struct NetworkManager {
    endpoints: Vec<Arc<TcpEndpoint>>,
    observer: Arc<dyn Observer>,
}

impl NetworkManager {
    pub fn new(
        config: &Config,
        local_identifier: Identifier,
        peers: Arc<service::PeerManager>,
        processor: Arc<AuthorizedProcessor>,
        observer: Arc<dyn Observer>,
        statistics: Arc<NodeStatistics>,
    ) -> Self {
        let timeouts = config.timeouts.clamped();
        let mut endpoints = Vec::with_capacity(config.endpoints.len());

        for (index, binding) in config.endpoints.iter().enumerate() {
            if binding.protocol != SUPPORTED_PROTOCOL {
                log::warn!("endpoint binding {index} names unsupported protocol {}", binding.protocol);
                continue;
            }

            endpoints.push(TcpEndpoint::new(
                index as u32,
                local_identifier,
                peers.clone(),
                processor.clone(),
                observer.clone(),
                statistics.clone(),
                timeouts.retry_limit,
                Duration::from_millis(timeouts.retry_interval_ms),
                Duration::from_millis(timeouts.connect_ms),
            ));
        }

        Self { endpoints, observer }
    }

    /// Binds every configured endpoint and dials every bootstrap entry.
    pub fn startup(&self, bindings: &[EndpointBinding], bootstrap: &[BootstrapEntry]) {
        for (endpoint, binding) in self.endpoints.iter().zip(bindings.iter().filter(|b| b.protocol == SUPPORTED_PROTOCOL)) {
            endpoint.startup();

            match RemoteAddress::parse(&binding.binding) {
                Ok(address) => {
                    endpoint.schedule_bind(address);
                }
                Err(err) => {
                    log::error!("unparseable bind address {}: {err:?}", binding.binding);
                }
            }
        }

        for entry in bootstrap.iter().filter(|entry| entry.protocol == SUPPORTED_PROTOCOL) {
            let Some(endpoint) = self.endpoints.first() else {
                continue;
            };

            match parse_bootstrap_address(&entry.address) {
                Ok(address) => {
                    endpoint.schedule_connect(address, None);
                }
                Err(err) => {
                    log::error!("unparseable bootstrap address {}: {err:?}", entry.address);
                    self.observer.on_event(&observer::connection_failed(
                        &RemoteAddress::parse("0.0.0.0:0").expect("loopback wildcard always parses"),
                        format!("unparseable bootstrap address {}: {err:?}", entry.address),
                    ));
                }
            }
        }
    }

    pub fn shutdown(&self) {
        for endpoint in &self.endpoints {
            endpoint.shutdown();
        }
    }

    /// Ad hoc outbound dial, distinct from the bootstrap entries dialed at
    /// startup. Tries the first endpoint matching `address`'s protocol.
    pub fn connect(&self, address: RemoteAddress, expected_identifier: Option<Identifier>) -> bool {
        let Some(endpoint) = self.endpoints.first() else {
            return false;
        };

        if address.protocol() != codec::address::Protocol::Tcp {
            return false;
        }

        endpoint.schedule_connect(address, expected_identifier)
    }

    pub fn disconnect(&self, identifier: Identifier) -> bool {
        self.endpoints.iter().any(|endpoint| endpoint.disconnect(identifier))
    }

    pub fn send(&self, identifier: Identifier, payload: &[u8]) -> bool {
        self.endpoints.iter().any(|endpoint| endpoint.schedule_send(identifier, payload))
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}
