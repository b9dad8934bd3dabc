//! Network handler: TCP connection lifecycle
//!
//! Accepts inbound connections, dials outbound ones and publishes them on
//! the bus (`PeerConnected`, then `PeerStreamConnected` carrying the
//! [`PeerConnection`]). A supervisor task per connection publishes
//! `PeerDisconnected` once the connection is closed, with the reason given
//! by whoever closed it first.
//!
//! Refuses connections beyond `max_peers`, duplicates, and hosts announced
//! in `PeersBlacklisted`. Closes connections on `DisconnectPeerRequest`.

use crate::config::duration_millis;
use crate::events::{Event, EventBus, EventKind};
use crate::network::connection::{PeerConnection, PeerIo};
use crate::network::peer::{DisconnectReason, NetworkError, PeerAddress};
use crate::network::server::{connect_to_peer, Server};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept connections on. `None` for outbound only.
    pub listen_address: Option<SocketAddr>,
    /// Max connections, inbound and outbound together
    pub max_peers: usize,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: Some(SocketAddr::from(([0, 0, 0, 0], 8333))),
            max_peers: 32,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct NetworkHandler {
    bus: EventBus,
    config: NetworkConfig,
    connections: RwLock<HashMap<PeerAddress, PeerConnection>>,
    banned: RwLock<HashSet<IpAddr>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkHandler {
    pub fn new(bus: EventBus, config: NetworkConfig) -> Arc<Self> {
        let handler = Arc::new(Self {
            bus,
            config,
            connections: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        });
        handler.register_for_events();
        handler
    }

    fn register_for_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.subscribe(&weak, EventKind::DisconnectPeerRequest, |h, event| {
            if let Event::DisconnectPeerRequest { peer, reason } = event {
                match reason {
                    Some(reason) => log::debug!("[{}] Disconnect requested: {}", peer, reason),
                    None => log::debug!("[{}] Disconnect requested", peer),
                }
                h.disconnect(peer);
            }
        });
        self.subscribe(&weak, EventKind::ConnectPeerRequest, |h, event| {
            if let Event::ConnectPeerRequest { peer } = event {
                h.spawn_connect(*peer);
            }
        });
        self.subscribe(&weak, EventKind::PeersBlacklisted, |h, event| {
            if let Event::PeersBlacklisted { hosts } = event {
                h.ban(hosts);
            }
        });
        self.subscribe(&weak, EventKind::PeersWhitelisted, |h, event| {
            if let Event::PeersWhitelisted { hosts } = event {
                let mut banned = h.banned.write().unwrap_or_else(PoisonError::into_inner);
                for host in hosts {
                    banned.remove(host);
                }
            }
        });
    }

    fn subscribe<F>(&self, weak: &Weak<Self>, kind: EventKind, f: F)
    where
        F: Fn(&Arc<Self>, &Event) + Send + Sync + 'static,
    {
        let weak = weak.clone();
        self.bus.subscribe(kind, move |event| {
            if let Some(handler) = weak.upgrade() {
                f(&handler, event);
            }
        });
    }

    /// Start listening (if configured) and publish `NetStart`. Returns the
    /// bound address.
    pub async fn start(self: &Arc<Self>) -> Result<Option<SocketAddr>, NetworkError> {
        let mut bound = None;
        if let Some(addr) = self.config.listen_address {
            let server = Server::bind(addr).await?;
            bound = Some(server.local_addr());
            *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = bound;
            let task = tokio::spawn(accept_loop(Arc::downgrade(self), server));
            *self.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }
        self.bus.publish(Event::NetStart);
        Ok(bound)
    }

    /// Stop accepting, close every connection and publish `NetStop`
    pub fn stop(&self) {
        self.bus.publish(Event::NetStop);
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let connections: Vec<PeerConnection> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.close(DisconnectReason::Local);
        }
        log::info!("Network stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dial `peer` and register the connection
    pub async fn connect(self: &Arc<Self>, peer: PeerAddress) -> Result<(), NetworkError> {
        if let Err(e) = self.check_admission(&peer) {
            self.reject(peer, &e);
            return Err(e);
        }
        log::debug!("[{}] Connecting...", peer);
        match connect_to_peer(peer, self.config.connect_timeout).await {
            Ok(stream) => self.register(peer, stream, false).map(|_| ()),
            Err(e) => {
                self.reject(peer, &e);
                Err(e)
            }
        }
    }

    fn spawn_connect(self: &Arc<Self>, peer: PeerAddress) {
        let Ok(runtime) = Handle::try_current() else {
            log::error!("[{}] Cannot connect outside a tokio runtime", peer);
            return;
        };
        let handler = Arc::clone(self);
        runtime.spawn(async move {
            // Failures are published as PeerRejected
            let _ = handler.connect(peer).await;
        });
    }

    /// Register an established connection and hand it over to the bus
    pub fn register<T: PeerIo>(
        self: &Arc<Self>,
        peer: PeerAddress,
        io: T,
        inbound: bool,
    ) -> Result<PeerConnection, NetworkError> {
        let connection = PeerConnection::new(peer, io, inbound);
        {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let admission = if connections.contains_key(&peer) {
                Err(NetworkError::AlreadyConnected(peer))
            } else if connections.len() >= self.config.max_peers {
                Err(NetworkError::MaxPeersReached)
            } else if self.is_banned(&peer.ip()) {
                Err(NetworkError::Blacklisted(peer.ip()))
            } else {
                Ok(())
            };
            if let Err(e) = admission {
                drop(connections);
                self.reject(peer, &e);
                connection.close(DisconnectReason::Local);
                return Err(e);
            }
            connections.insert(peer, connection.clone());
        }

        log::info!(
            "[{}] Connected ({})",
            peer,
            if inbound { "inbound" } else { "outbound" }
        );
        tokio::spawn(supervise(Arc::downgrade(self), connection.clone()));
        self.bus.publish(Event::PeerConnected { peer, inbound });
        self.bus.publish(Event::PeerStreamConnected {
            peer,
            connection: connection.clone(),
        });
        Ok(connection)
    }

    /// Close the connection to `peer`. Returns `false` if not connected.
    pub fn disconnect(&self, peer: &PeerAddress) -> bool {
        let connection = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned();
        match connection {
            Some(connection) => {
                connection.close(DisconnectReason::Local);
                true
            }
            None => {
                log::trace!("[{}] Disconnect ignored (not connected)", peer);
                false
            }
        }
    }

    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_banned(&self, host: &IpAddr) -> bool {
        self.banned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(host)
    }

    fn ban(&self, hosts: &[IpAddr]) {
        self.banned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(hosts.iter().copied());
        let connected: Vec<PeerAddress> = self
            .connected_peers()
            .into_iter()
            .filter(|p| hosts.contains(&p.ip()))
            .collect();
        for peer in connected {
            log::info!("[{}] Host blacklisted, disconnecting", peer);
            self.disconnect(&peer);
        }
    }

    fn check_admission(&self, peer: &PeerAddress) -> Result<(), NetworkError> {
        if self.is_banned(&peer.ip()) {
            return Err(NetworkError::Blacklisted(peer.ip()));
        }
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.contains_key(peer) {
            return Err(NetworkError::AlreadyConnected(*peer));
        }
        if connections.len() >= self.config.max_peers {
            return Err(NetworkError::MaxPeersReached);
        }
        Ok(())
    }

    fn reject(&self, peer: PeerAddress, error: &NetworkError) {
        log::debug!("[{}] Rejected: {}", peer, error);
        self.bus.publish(Event::PeerRejected {
            peer,
            reason: error.to_string(),
        });
    }

    fn on_closed(&self, connection: &PeerConnection) {
        let peer = connection.peer();
        {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if connections.get(&peer).is_some_and(|c| c.same_as(connection)) {
                connections.remove(&peer);
            }
        }
        let reason = connection
            .close_reason()
            .unwrap_or(DisconnectReason::Undefined);
        log::info!("[{}] Disconnected ({})", peer, reason);
        self.bus.publish(Event::PeerDisconnected { peer, reason });
    }
}

async fn accept_loop(handler: Weak<NetworkHandler>, server: Server) {
    loop {
        let accepted = server.accept().await;
        let Some(handler) = handler.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => {
                // Refusals are already logged and published
                let _ = handler.register(peer, stream, true);
            }
            Err(e) => {
                log::warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn supervise(handler: Weak<NetworkHandler>, connection: PeerConnection) {
    connection.wait_closed().await;
    if let Some(handler) = handler.upgrade() {
        handler.on_closed(&connection);
    }
}
