//! LAN transport: mDNS discovery plus QUIC sessions.
//!
//! A session is one QUIC connection. The dialling side opens it with a hello
//! stream naming itself, then every message travels on its own
//! unidirectional stream. Only the peer with the lexicographically smaller id
//! dials, so two browsing peers never build duplicate sessions.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mdns_sd::ServiceEvent;
use parking_lot::Mutex;
use quinn::{Connection, Endpoint};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::discovery::{instance_from_fullname, Discovery};
use super::{quic, Transport, TransportEvent};
use crate::config::MeshConfig;
use crate::error::TransportError;
use crate::peer::{ConnectionState, PeerId};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const HELLO_LIMIT: usize = 4 * 1024;

#[derive(Serialize, Deserialize)]
struct Hello {
    hello: PeerId,
}

struct LanInner {
    id: PeerId,
    endpoint: Endpoint,
    port: u16,
    service_type: String,
    max_message_bytes: usize,
    discovery: Mutex<Discovery>,
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
    // Peers given by hand, announced every time browsing starts
    manual: Mutex<HashMap<PeerId, SocketAddr>>,
    sessions: Mutex<HashMap<PeerId, Connection>>,
    events_tx: broadcast::Sender<TransportEvent>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

pub struct LanTransport {
    inner: Arc<LanInner>,
}

impl LanTransport {
    /// Bind the QUIC endpoint and start accepting sessions.
    ///
    /// Must be called inside a tokio runtime. Advertising and browsing stay
    /// off until the mesh starts them.
    pub fn bind(id: PeerId, config: &MeshConfig, port: u16) -> Result<Self, TransportError> {
        let endpoint = quic::bind(port)?;
        let port = endpoint.local_addr()?.port();
        let service_type = config.service_type();
        let discovery = Discovery::new(service_type.clone())?;
        let (events_tx, _) = broadcast::channel(config.event_capacity);

        let inner = Arc::new(LanInner {
            id,
            endpoint,
            port,
            service_type,
            max_message_bytes: config.max_message_bytes,
            discovery: Mutex::new(discovery),
            addresses: Mutex::new(HashMap::new()),
            manual: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            events_tx,
            browse_task: Mutex::new(None),
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(accept_loop(inner.clone()));
        *inner.accept_task.lock() = Some(accept);

        tracing::info!(peer = %inner.id, port, "QUIC transport listening");
        Ok(Self { inner })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Make a peer reachable without mDNS, for networks that block multicast.
    pub fn add_known_address(&self, peer: PeerId, addr: SocketAddr) {
        if peer == self.inner.id {
            return;
        }
        tracing::info!(peer = %peer, %addr, "Added manual peer");
        self.inner.manual.lock().insert(peer.clone(), addr);
        self.inner.addresses.lock().insert(peer.clone(), addr);
        if self.inner.browse_task.lock().is_some() {
            self.inner.emit(TransportEvent::PeerDiscovered(peer));
        }
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        if let Some(task) = self.inner.browse_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        self.inner.endpoint.close(0u32.into(), b"shutdown");
    }
}

impl LanInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn live_session(&self, peer: &PeerId) -> Option<Connection> {
        self.sessions
            .lock()
            .get(peer)
            .filter(|conn| conn.close_reason().is_none())
            .cloned()
    }

    fn register_session(self: &Arc<Self>, peer: PeerId, conn: Connection) {
        let previous = self.sessions.lock().insert(peer.clone(), conn.clone());
        if let Some(old) = previous {
            if old.stable_id() != conn.stable_id() {
                old.close(0u32.into(), b"replaced");
            }
        }
        tracing::debug!(peer = %peer, remote = %conn.remote_address(), "Session established");
        self.emit(TransportEvent::SessionStateChanged(
            peer.clone(),
            ConnectionState::Connected,
        ));
        tokio::spawn(read_loop(self.clone(), peer, conn));
    }
}

async fn accept_loop(inner: Arc<LanInner>) {
    while let Some(incoming) = inner.endpoint.accept().await {
        let inner = inner.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Incoming connection failed: {}", e);
                    return;
                }
            };
            let peer = match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&conn)).await {
                Ok(Ok(peer)) => peer,
                Ok(Err(e)) => {
                    tracing::warn!(remote = %conn.remote_address(), "Bad session hello: {}", e);
                    conn.close(1u32.into(), b"bad hello");
                    return;
                }
                Err(_) => {
                    tracing::warn!(remote = %conn.remote_address(), "No session hello");
                    conn.close(1u32.into(), b"no hello");
                    return;
                }
            };
            inner.emit(TransportEvent::SessionStateChanged(
                peer.clone(),
                ConnectionState::Connecting,
            ));
            inner.register_session(peer, conn);
        });
    }
}

async fn read_hello(conn: &Connection) -> Result<PeerId, TransportError> {
    let recv = conn
        .accept_uni()
        .await
        .map_err(|e| TransportError::Stream(e.to_string()))?;
    let buf = quic::read_message(recv, HELLO_LIMIT).await?;
    let hello: Hello =
        serde_json::from_slice(&buf).map_err(|e| TransportError::Stream(e.to_string()))?;
    Ok(hello.hello)
}

async fn read_loop(inner: Arc<LanInner>, peer: PeerId, conn: Connection) {
    loop {
        match conn.accept_uni().await {
            Ok(recv) => match quic::read_message(recv, inner.max_message_bytes).await {
                Ok(buf) => {
                    tracing::trace!(peer = %peer, len = buf.len(), "Received message");
                    inner.emit(TransportEvent::DataReceived(peer.clone(), Bytes::from(buf)));
                }
                Err(e) => tracing::warn!(peer = %peer, "Dropped incoming message: {}", e),
            },
            Err(e) => {
                tracing::debug!(peer = %peer, "Session closed: {}", e);
                break;
            }
        }
    }

    // A replaced connection must not report the newer session as gone
    let removed = {
        let mut sessions = inner.sessions.lock();
        let current = sessions.get(&peer).map(Connection::stable_id) == Some(conn.stable_id());
        if current {
            sessions.remove(&peer);
        }
        current
    };
    if removed {
        inner.emit(TransportEvent::SessionStateChanged(
            peer,
            ConnectionState::NotConnected,
        ));
    }
}

async fn browse_loop(inner: Arc<LanInner>, receiver: mdns_sd::Receiver<ServiceEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(id) = info.get_property_val_str("id").map(PeerId::from) else {
                    tracing::debug!("Ignoring service without id: {:?}", info.get_properties());
                    continue;
                };
                if id == inner.id {
                    continue;
                }
                // Prefer IPv4; scoped IPv6 addresses do not parse and are skipped
                let ip = info
                    .get_addresses()
                    .iter()
                    .filter_map(|ip| ip.to_string().parse::<IpAddr>().ok())
                    .min_by_key(|ip| ip.is_ipv6());
                let Some(ip) = ip else {
                    continue;
                };
                let addr = SocketAddr::new(ip, info.get_port());
                tracing::debug!(peer = %id, %addr, "Resolved peer");
                inner.addresses.lock().insert(id.clone(), addr);
                inner.emit(TransportEvent::PeerDiscovered(id));
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                let id = PeerId::from(instance_from_fullname(&fullname, &inner.service_type));
                if id == inner.id {
                    continue;
                }
                inner.addresses.lock().remove(&id);
                inner.emit(TransportEvent::PeerLost(id));
            }
            _ => {}
        }
    }
}

impl Transport for LanTransport {
    fn local_id(&self) -> &PeerId {
        &self.inner.id
    }

    fn start_advertising(&self) -> Result<(), TransportError> {
        self.inner
            .discovery
            .lock()
            .register(&self.inner.id, self.inner.port)
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        self.inner.discovery.lock().unregister()
    }

    fn start_browsing(&self) -> Result<(), TransportError> {
        let receiver = self.inner.discovery.lock().browse()?;
        let task = tokio::spawn(browse_loop(self.inner.clone(), receiver));
        if let Some(old) = self.inner.browse_task.lock().replace(task) {
            old.abort();
        }

        let manual: Vec<(PeerId, SocketAddr)> = self
            .inner
            .manual
            .lock()
            .iter()
            .map(|(peer, addr)| (peer.clone(), *addr))
            .collect();
        for (peer, addr) in manual {
            self.inner.addresses.lock().insert(peer.clone(), addr);
            self.inner.emit(TransportEvent::PeerDiscovered(peer));
        }
        Ok(())
    }

    fn stop_browsing(&self) -> Result<(), TransportError> {
        if let Some(task) = self.inner.browse_task.lock().take() {
            task.abort();
        }
        self.inner.discovery.lock().stop_browse()
    }

    async fn invite(&self, peer: &PeerId) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.live_session(peer).is_some() {
            return Ok(());
        }
        if inner.id > *peer {
            tracing::debug!(peer = %peer, "Waiting for peer to dial");
            return Ok(());
        }
        let addr = inner
            .addresses
            .lock()
            .get(peer)
            .copied()
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;

        inner.emit(TransportEvent::SessionStateChanged(
            peer.clone(),
            ConnectionState::Connecting,
        ));
        let dialled = async {
            let conn = quic::connect(&inner.endpoint, addr).await?;
            let hello = serde_json::to_vec(&Hello {
                hello: inner.id.clone(),
            })
            .map_err(|e| TransportError::Stream(e.to_string()))?;
            quic::write_message(&conn, &hello).await?;
            Ok::<_, TransportError>(conn)
        }
        .await;

        match dialled {
            Ok(conn) => {
                inner.register_session(peer.clone(), conn);
                Ok(())
            }
            Err(e) => {
                inner.emit(TransportEvent::SessionStateChanged(
                    peer.clone(),
                    ConnectionState::NotConnected,
                ));
                Err(e)
            }
        }
    }

    async fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        let conn = self
            .inner
            .live_session(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.to_string()))?;
        quic::write_message(&conn, &data).await
    }

    fn disconnect(&self, peer: &PeerId) {
        let removed = self.inner.sessions.lock().remove(peer);
        if let Some(conn) = removed {
            conn.close(0u32.into(), b"disconnect");
            self.inner.emit(TransportEvent::SessionStateChanged(
                peer.clone(),
                ConnectionState::NotConnected,
            ));
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_manual_peer_session_and_message() {
        let config = MeshConfig::default();
        let a = LanTransport::bind(PeerId::from("a"), &config, 0).unwrap();
        let b = LanTransport::bind(PeerId::from("b"), &config, 0).unwrap();
        let mut b_events = b.events();

        a.add_known_address(PeerId::from("b"), SocketAddr::from(([127, 0, 0, 1], b.port())));
        a.invite(&PeerId::from("b")).await.unwrap();

        assert_eq!(
            next_event(&mut b_events).await,
            TransportEvent::SessionStateChanged(PeerId::from("a"), ConnectionState::Connecting)
        );
        assert_eq!(
            next_event(&mut b_events).await,
            TransportEvent::SessionStateChanged(PeerId::from("a"), ConnectionState::Connected)
        );

        a.send(&PeerId::from("b"), b"hello".to_vec()).await.unwrap();
        assert_eq!(
            next_event(&mut b_events).await,
            TransportEvent::DataReceived(PeerId::from("a"), Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn test_larger_id_waits_to_be_dialled() {
        let config = MeshConfig::default();
        let z = LanTransport::bind(PeerId::from("z"), &config, 0).unwrap();

        // No address is known, yet the invite succeeds because z never dials "a"
        z.invite(&PeerId::from("a")).await.unwrap();
        assert!(matches!(
            z.send(&PeerId::from("a"), b"x".to_vec()).await,
            Err(TransportError::NotConnected(_))
        ));
    }
}
