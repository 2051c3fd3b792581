//! Wires configuration, the peer/router/awaitable bundle, the scheduler,
//! the network manager, and the runtime policy into a single running node.

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod network;
pub mod observer;
pub mod processor;
pub mod runtime;
pub mod statistics;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashSet;
use codec::identifier::Identifier;
use scheduler::{Delegate, Registrar, identifier_for};
use service::{RequestKind, RouteHandler, Service};

use config::{Config, IdentifierPersistence};
use dispatch::{PendingRequests, RequestCallback};
use network::NetworkManager;
use observer::{Event, LoggingObserver, Observer, RuntimeStopCause};
use processor::AuthorizedProcessor;
use runtime::{Background, ExecutionToken, Foreground, RuntimeCore};
use statistics::NodeStatistics;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Establishes the node's identifier per `config.identifier_persistence`,
/// reading and, if necessary, writing `config.identifier_path`.
fn resolve_identifier(config: &Config) -> Identifier {
    match config.identifier_persistence {
        IdentifierPersistence::Ephemeral => Identifier::generate(),
        IdentifierPersistence::Persistent => load_or_generate_identifier(&config.identifier_path),
    }
}

fn load_or_generate_identifier(path: &str) -> Identifier {
    if let Ok(text) = std::fs::read_to_string(path) {
        if let Some(identifier) = extract_persisted_identifier(&text) {
            return identifier;
        }
        log::warn!("{path} did not contain a usable identifier, generating a fresh one");
    }

    let identifier = Identifier::generate();
    let text = format!("{{\"identifier\":\"{}\"}}\n", identifier.to_external());
    if let Err(err) = std::fs::write(path, text) {
        log::warn!("failed to persist identifier to {path}: {err}");
    }

    identifier
}

fn extract_persisted_identifier(text: &str) -> Option<Identifier> {
    #[derive(serde::Deserialize)]
    struct Persisted {
        identifier: String,
    }

    let persisted: Persisted = serde_json5::from_str(text).ok()?;
    Identifier::parse_external(&persisted.identifier).ok()
}

/// Owns the fully assembled node: the peer/router/awaitable bundle, the
/// network manager, and the scheduler's registrar.
pub struct Node {
    local_identifier: Identifier,
    service: Arc<Service>,
    network: Arc<NetworkManager>,
    pending: Arc<PendingRequests>,
    observer: Arc<dyn Observer>,
}

impl Node {
    pub fn local_identifier(&self) -> Identifier {
        self.local_identifier
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn send(&self, identifier: Identifier, payload: &[u8]) -> bool {
        self.network.send(identifier, payload)
    }

    /// Registers a handler for `route`. Safe to call before or after startup.
    pub fn route(&self, route: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        self.service.router.register(route, handler);
    }

    /// Dials `address` and, if `expected_identifier` is given, fast-paths a
    /// heartbeat instead of a fresh handshake once that peer is already
    /// known.
    pub fn connect(&self, address: &str, expected_identifier: Option<Identifier>) -> bool {
        let Ok(parsed) = codec::address::RemoteAddress::parse(address) else {
            return false;
        };
        self.network.connect(parsed, expected_identifier)
    }

    pub fn disconnect(&self, identifier: Identifier) -> bool {
        self.network.disconnect(identifier)
    }

    /// Fire-and-forget send to a single known peer.
    pub fn dispatch(&self, target: Identifier, route: &str, payload: Vec<u8>) -> bool {
        dispatch::dispatch_to(&self.service.peers, self.local_identifier, target, route, payload, now_ms())
    }

    /// Fire-and-forget send to every active peer.
    pub fn cluster_dispatch(&self, route: &str, payload: Vec<u8>) -> usize {
        dispatch::fanout_dispatch(&self.service.peers, self.local_identifier, route, payload, 1.0, now_ms())
    }

    /// Fire-and-forget send to a `fraction` share of active peers.
    pub fn sample_dispatch(&self, route: &str, payload: Vec<u8>, fraction: f64) -> usize {
        dispatch::fanout_dispatch(&self.service.peers, self.local_identifier, route, payload, fraction, now_ms())
    }

    /// Stages a tracked request against `targets`, invoking `callback` once
    /// every expected peer has responded or the tracker's deadline passes.
    pub fn request(
        &self,
        targets: &[Identifier],
        kind: RequestKind,
        route: &str,
        payload: Vec<u8>,
        timeout_ms: u64,
        callback: RequestCallback,
    ) -> bool {
        dispatch::request(
            &self.service.peers,
            &self.service.awaitable,
            &self.pending,
            self.local_identifier,
            targets,
            kind,
            route,
            payload,
            timeout_ms,
            now_ms(),
            callback,
        )
    }

    fn startup(&self, bindings: &[config::EndpointBinding], bootstrap: &[config::BootstrapEntry]) {
        self.network.startup(bindings, bootstrap);
        self.observer.on_event(&Event::RuntimeStarted);
    }

    fn shutdown(&self) {
        self.network.shutdown();
    }
}

impl RuntimeCore for Node {
    fn on_runtime_stopped(&self, cause: RuntimeStopCause) {
        self.shutdown();
        self.observer.on_event(&Event::RuntimeStopped { cause });
    }
}

/// Assembles the node's collaborators from `config` and returns it alongside
/// the scheduler's registrar, before anything has bound or dialed.
fn build(config: &Config) -> (Arc<Node>, Arc<Registrar>) {
    let local_identifier = resolve_identifier(config);
    let observer: Arc<dyn Observer> = Arc::new(LoggingObserver);
    let statistics = Arc::new(NodeStatistics::default());
    let service = Arc::new(Service::with_replay_window(local_identifier, config.replay_window_size));

    let processor = Arc::new(AuthorizedProcessor::new(local_identifier, service.router.clone(), service.awaitable.clone()));

    let network = Arc::new(NetworkManager::new(
        config,
        local_identifier,
        service.peers.clone(),
        processor,
        observer.clone(),
        statistics,
    ));

    let registrar = Arc::new(Registrar::new());
    let pending = Arc::new(PendingRequests::default());

    let awaitable = service.awaitable.clone();
    let sweep_pending = pending.clone();
    let sweep_delegate = Delegate::new(
        identifier_for("awaitable_tracking_service"),
        AHashSet::default(),
        Arc::downgrade(&registrar.sentinel()),
        move |_frame| {
            awaitable.execute(now_ms(), |completed| {
                dispatch::handle_completed_tracker(&sweep_pending, local_identifier, completed, now_ms());
            })
        },
    );
    sweep_delegate.set_always_ready(true);
    registrar.register(Arc::new(sweep_delegate));

    let node = Arc::new(Node {
        local_identifier,
        service,
        network,
        pending,
        observer,
    });

    (node, registrar)
}

/// Starts the node's network and runs the scheduler on the calling thread
/// until a stop is requested.
pub async fn run_foreground(config: Arc<Config>) -> anyhow::Result<()> {
    let (node, registrar) = build(&config);
    registrar.initialize()?;
    node.startup(&config.endpoints, &config.bootstrap);

    let policy = Foreground::new(registrar);
    let core: Arc<dyn RuntimeCore> = node;
    tokio::task::spawn_blocking(move || policy.start(core.as_ref())).await?;

    Ok(())
}

/// Starts the node's network and runs the scheduler on a spawned worker
/// thread, returning once it has been spawned.
pub fn run_background(config: Arc<Config>) -> anyhow::Result<(Arc<Node>, Arc<Background>)> {
    let (node, registrar) = build(&config);
    registrar.initialize()?;
    node.startup(&config.endpoints, &config.bootstrap);

    let policy = Arc::new(Background::new(registrar));
    let core: Arc<dyn RuntimeCore> = node.clone();
    let token = policy.start(core);
    debug_assert_eq!(token, ExecutionToken::ThreadSpawned);

    Ok((node, policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_identifiers_are_not_persisted() {
        let config = Config::default();
        let a = resolve_identifier(&config);
        let b = resolve_identifier(&config);
        assert_ne!(a, b);
    }

    #[test]
    fn persistent_identifier_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("brypt-identifier-test-{}.json5", now_ms()));
        let config = Config {
            identifier_persistence: IdentifierPersistence::Persistent,
            identifier_path: path.to_string_lossy().to_string(),
            ..Config::default()
        };

        let first = resolve_identifier(&config);
        let second = resolve_identifier(&config);
        assert_eq!(first, second);

        let _ = std::fs::remove_file(&path);
    }
}
