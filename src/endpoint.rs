//! TCP Endpoint Abstraction: owns a listening or connecting transport
//! socket, frames bytes as length-prefixed Z85 strings, and hands complete
//! parcels to the peer directory. Endpoint threads never touch peer state
//! directly; they go through `PeerManager`/`PeerProxy`, whose own locks
//! serialize register/withdraw against the core's receive/send path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Buf, BytesMut};
use codec::address::{Protocol, RemoteAddress};
use codec::identifier::Identifier;
use codec::parcel::peek_source;
use parking_lot::Mutex;
use service::{EndpointRegistration, MessageContext, PeerManager, PeerProxy, Receiver};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::observer::{self, Event, Observer};
use crate::processor::AuthorizedProcessor;
use crate::statistics::{NodeStatistics, Report};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Linked,
    Closed,
}

fn frame(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Pulls complete length-prefixed frames out of `buf`, leaving any partial
/// trailing frame in place for the next read.
fn take_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
    if buf.len() < 4 {
        return None;
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }

    buf.advance(4);
    Some(buf.split_to(len).to_vec())
}

/// A server-bound or client-connecting TCP endpoint.
pub struct TcpEndpoint {
    id: u32,
    local_identifier: Identifier,
    peers: Arc<PeerManager>,
    processor: Arc<AuthorizedProcessor>,
    observer: Arc<dyn Observer>,
    statistics: Arc<NodeStatistics>,
    retry_limit: u32,
    retry_interval: Duration,
    connect_timeout: Duration,
    active: AtomicBool,
    next_connection_id: AtomicU32,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    closers: Mutex<AHashMap<Identifier, watch::Sender<bool>>>,
}

impl TcpEndpoint {
    pub fn new(
        id: u32,
        local_identifier: Identifier,
        peers: Arc<PeerManager>,
        processor: Arc<AuthorizedProcessor>,
        observer: Arc<dyn Observer>,
        statistics: Arc<NodeStatistics>,
        retry_limit: u32,
        retry_interval: Duration,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            local_identifier,
            peers,
            processor,
            observer,
            statistics,
            retry_limit,
            retry_interval,
            connect_timeout,
            active: AtomicBool::new(false),
            next_connection_id: AtomicU32::new(1),
            accept_handle: Mutex::new(None),
            closers: Mutex::new(AHashMap::default()),
        })
    }

    pub fn startup(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) -> bool {
        self.active.store(false, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.lock().take() {
            handle.abort();
        }
        true
    }

    /// Server only: binds `address` and spawns the accept loop.
    pub fn schedule_bind(self: &Arc<Self>, address: RemoteAddress) -> bool {
        let authority = if address.is_wildcard() { "0.0.0.0:0" } else { address.authority() };
        let Ok(bind_addr) = authority.parse::<SocketAddr>() else {
            self.observer.on_event(&observer::binding_failed(&address, "unparseable bind authority"));
            return false;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(bind_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    this.observer.on_event(&observer::binding_failed(&address, err.to_string()));
                    return;
                }
            };

            this.observer.on_event(&Event::EndpointStarted { protocol: Protocol::Tcp, uri: address.to_string() });

            while this.is_active() {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let remote = RemoteAddress::parse(&peer_addr.to_string()).unwrap_or_else(|_| address.clone());
                        this.clone().spawn_connection(stream, remote, None);
                    }
                    Err(err) => {
                        log::warn!("tcp accept failed on {address}: {err}");
                        break;
                    }
                }
            }

            this.observer.on_event(&Event::EndpointStopped { protocol: Protocol::Tcp, uri: address.to_string() });
        });

        true
    }

    /// Client only: dials `address`, retrying up to the configured limit,
    /// sending the handshake frame `PeerManager::declare_resolving` hands
    /// back as the connection's first outbound frame.
    pub fn schedule_connect(self: &Arc<Self>, address: RemoteAddress, expected_identifier: Option<Identifier>) -> bool {
        let Some(request) = self.peers.declare_resolving(&address, expected_identifier) else {
            return false;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let Ok(authority) = address.authority().parse::<SocketAddr>() else {
                this.peers.undeclare_resolving(&address);
                this.observer.on_event(&observer::connection_failed(&address, "unparseable authority"));
                return;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                let outcome = tokio::time::timeout(this.connect_timeout, TcpStream::connect(authority)).await;

                match outcome {
                    Ok(Ok(stream)) => {
                        this.clone().spawn_connection(stream, address.clone(), Some(request.handshake_bytes.clone()));
                        return;
                    }
                    Ok(Err(err)) => {
                        if attempt > this.retry_limit {
                            this.peers.undeclare_resolving(&address);
                            this.observer.on_event(&observer::connection_failed(&address, err.to_string()));
                            return;
                        }
                    }
                    Err(_) => {
                        if attempt > this.retry_limit {
                            this.peers.undeclare_resolving(&address);
                            this.observer.on_event(&observer::connection_failed(&address, "connect timed out"));
                            return;
                        }
                    }
                }

                tokio::time::sleep(this.retry_interval).await;
            }
        });

        true
    }

    /// Sends to whichever of the peer's registrations this call lands on;
    /// `PeerProxy::schedule_send_any` picks the registration.
    pub fn schedule_send(&self, identifier: Identifier, payload: &[u8]) -> bool {
        let Some(proxy) = self.peers.get(identifier) else {
            return false;
        };

        proxy.schedule_send_any(payload, crate::now_ms())
    }

    /// Forces the socket carrying `identifier`'s session closed, if this
    /// endpoint currently holds a registration for it.
    pub fn disconnect(&self, identifier: Identifier) -> bool {
        let Some(closer) = self.closers.lock().remove(&identifier) else {
            return false;
        };
        closer.send(true).is_ok()
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream, address: RemoteAddress, initial_frame: Option<String>) {
        if let Err(err) = stream.set_nodelay(true) {
            log::warn!("tcp set_nodelay failed for {address}: {err}");
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader_half, mut writer_half) = stream.into_split();
        let (tx, mut rx) = unbounded_channel::<Vec<u8>>();
        let (close_tx, close_rx) = watch::channel(false);

        if let Some(text) = initial_frame {
            let _ = tx.send(frame(&text));
        }

        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if writer_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let send: service::SendClosure = Arc::new(move |_identifier, bytes: &[u8]| tx.send(frame(std::str::from_utf8(bytes).unwrap_or_default())).is_ok());

        let this = self.clone();
        tokio::spawn(async move {
            this.read_connection(reader_half, connection_id, address, send, close_tx, close_rx).await;
        });
    }

    async fn read_connection(
        self: Arc<Self>,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        connection_id: u32,
        address: RemoteAddress,
        send: service::SendClosure,
        close_tx: watch::Sender<bool>,
        mut close_rx: watch::Receiver<bool>,
    ) {
        let reporter = self.statistics.get_reporter();
        let mut buf = BytesMut::with_capacity(4096);
        let mut proxy: Option<Arc<PeerProxy>> = None;
        let mut state = ConnectionState::Handshaking;

        'read: loop {
            let read = tokio::select! {
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) | Err(_) => break 'read,
                    Ok(n) => n,
                },
                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        break 'read;
                    }
                    continue 'read;
                }
            };

            reporter_send_if_linked(&reporter, &proxy, Report::ReceivedBytes(read as u32));

            while let Some(payload) = take_frame(&mut buf) {
                let Ok(text) = String::from_utf8(payload) else {
                    log::debug!("dropped non-utf8 frame from {address}");
                    continue;
                };

                reporter_send_if_linked(&reporter, &proxy, Report::ReceivedPkts(1));

                if proxy.is_none() {
                    let Some(source) = peek_source(&text) else {
                        log::debug!("dropped unparseable first frame from {address}");
                        continue;
                    };

                    let linked = self.peers.link_peer(source, &address);
                    self.statistics.register(source);
                    linked.register_endpoint(
                        connection_id,
                        EndpointRegistration {
                            context: Arc::new(MessageContext::new(connection_id, Protocol::Tcp, Arc::downgrade(&linked))),
                            send: send.clone(),
                            remote_address: address.clone(),
                        },
                    );
                    self.closers.lock().insert(source, close_tx.clone());
                    proxy = Some(linked);
                }

                let Some(active_proxy) = proxy.as_ref() else { continue };
                let was_authorized = active_proxy.is_authorized();

                active_proxy.schedule_receive(connection_id, text.into_bytes(), crate::now_ms());

                if !was_authorized && active_proxy.is_authorized() {
                    state = ConnectionState::Linked;
                    let authorized_processor: Arc<dyn Receiver> = self.processor.clone();
                    let keys = active_proxy.mediator().and_then(|m| m.keys());
                    if let Some(keys) = keys {
                        active_proxy.on_authorized(keys, authorized_processor);
                    }

                    self.observer.on_event(&Event::PeerConnected { identifier: active_proxy.identifier() });
                    self.peers.dispatch_peer_state_change(active_proxy, connection_id, service::ProxyStateChange::Connected);
                }
            }
        }

        state = ConnectionState::Closed;
        let _ = state;

        if let Some(active_proxy) = proxy {
            self.closers.lock().remove(&active_proxy.identifier());
            active_proxy.withdraw_endpoint(connection_id);
            self.statistics.unregister(&active_proxy.identifier());
            self.peers.dispatch_peer_state_change(&active_proxy, connection_id, service::ProxyStateChange::Disconnected);
            self.observer.on_event(&Event::PeerDisconnected { identifier: active_proxy.identifier(), cause: "session-closed".to_string() });
        }
    }
}

fn reporter_send_if_linked(reporter: &crate::statistics::StatisticsReporter, proxy: &Option<Arc<PeerProxy>>, report: Report) {
    if let Some(proxy) = proxy {
        reporter.send(&proxy.identifier(), &[report]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_take_frame() {
        let encoded = frame("hello");
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = take_frame(&mut buf).unwrap();
        assert_eq!(decoded, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn take_frame_waits_for_a_partial_trailing_frame() {
        let encoded = frame("hello");
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(take_frame(&mut buf).is_none());
    }

    #[test]
    fn take_frame_extracts_multiple_frames_from_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame("a"));
        buf.extend_from_slice(&frame("bb"));

        assert_eq!(take_frame(&mut buf).unwrap(), b"a");
        assert_eq!(take_frame(&mut buf).unwrap(), b"bb");
        assert!(take_frame(&mut buf).is_none());
    }
}
