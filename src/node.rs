//! Node: one event bus with every handler wired onto it
//!
//! The node owns the bus and the handlers. Everything else (application
//! logic, the CLI) talks to the node or subscribes to its bus.

use crate::config::{ConfigError, Network, ProtocolConfig};
use crate::events::{DispatchMode, Event, EventBus, EventKind, SubscriptionId};
use crate::handlers::{
    BlacklistConfig, BlacklistHandler, MessageHandler, PingPongConfig, PingPongHandler,
};
use crate::network::{NetworkConfig, NetworkError, NetworkHandler, PeerAddress};
use crate::stream::DeserializerConfig;
use crate::wire::{BitcoinMsg, Message};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub protocol: ProtocolConfig,
    pub network: NetworkConfig,
    pub deserializer: DeserializerConfig,
    pub ping_pong: PingPongConfig,
    pub blacklist: BlacklistConfig,
    pub dispatch: DispatchMode,
    /// Peers dialed on start
    pub bootstrap_peers: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_network(Network::Mainnet)
    }
}

impl NodeConfig {
    /// Defaults for `network`: its magic everywhere and its default port
    pub fn for_network(network: Network) -> Self {
        let protocol = ProtocolConfig::for_network(network);
        let network_config = NetworkConfig {
            listen_address: Some(SocketAddr::from(([0, 0, 0, 0], protocol.port))),
            ..Default::default()
        };
        let deserializer = DeserializerConfig {
            magic: protocol.magic,
            ..Default::default()
        };
        Self {
            protocol,
            network: network_config,
            deserializer,
            ping_pong: PingPongConfig::default(),
            blacklist: BlacklistConfig::default(),
            dispatch: DispatchMode::default(),
            bootstrap_peers: Vec::new(),
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.deserializer.validate()?;
        if self.network.max_peers == 0 {
            return Err(ConfigError::Invalid {
                name: "max_peers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ping_pong.check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "check_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.blacklist.threshold == 0 {
            return Err(ConfigError::Invalid {
                name: "threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// A running P2P node
pub struct Node {
    config: NodeConfig,
    bus: EventBus,
    network: Arc<NetworkHandler>,
    messages: Arc<MessageHandler>,
    ping_pong: Arc<PingPongHandler>,
    blacklist: Arc<BlacklistHandler>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build the bus and the handlers. Nothing touches the network until
    /// [`Node::start`].
    pub fn new(mut config: NodeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        // A single magic for the whole node
        config.deserializer.magic = config.protocol.magic;

        let bus = EventBus::new(config.dispatch);
        let network = NetworkHandler::new(bus.clone(), config.network.clone());
        let messages = MessageHandler::new(bus.clone(), config.deserializer.clone())?;
        let ping_pong = PingPongHandler::new(
            bus.clone(),
            config.protocol.magic,
            config.ping_pong.clone(),
        );
        let blacklist = BlacklistHandler::new(bus.clone(), config.blacklist.clone());

        Ok(Self {
            config,
            bus,
            network,
            messages,
            ping_pong,
            blacklist,
            ping_task: Mutex::new(None),
        })
    }

    /// Start listening, start the liveness checks and dial the bootstrap
    /// peers. Returns the address the node listens on, if any.
    pub async fn start(&self) -> Result<Option<SocketAddr>, NetworkError> {
        let local = self.network.start().await?;
        match local {
            Some(addr) => log::info!(
                "Node started on {} ({}, magic {:#010x})",
                addr,
                self.config.protocol.network,
                self.config.protocol.magic
            ),
            None => log::info!("Node started without listener ({})", self.config.protocol.network),
        }

        let task = self.ping_pong.start();
        if let Some(old) = self
            .ping_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            old.abort();
        }

        for addr in &self.config.bootstrap_peers {
            if let Err(e) = self.connect_to(PeerAddress::from(*addr)).await {
                log::warn!("[{}] Bootstrap connection failed: {}", addr, e);
            }
        }
        Ok(local)
    }

    pub async fn connect_to(&self, peer: PeerAddress) -> Result<(), NetworkError> {
        self.network.connect(peer).await
    }

    /// Request a disconnection, as a protocol violation when `reason` is set
    pub fn disconnect(&self, peer: PeerAddress, reason: Option<String>) {
        self.bus.publish(Event::DisconnectPeerRequest { peer, reason });
    }

    pub fn send(&self, peer: PeerAddress, body: Message) {
        self.messages.send(peer, self.wrap(body));
    }

    pub fn broadcast(&self, body: Message) {
        self.messages.broadcast(self.wrap(body));
    }

    /// Wrap `body` in a header for this node's network
    pub fn wrap(&self, body: Message) -> BitcoinMsg {
        BitcoinMsg::new(self.config.protocol.magic, body)
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .ping_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.network.stop();
        log::info!("Node stopped");
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn network(&self) -> &Arc<NetworkHandler> {
        &self.network
    }

    pub fn messages(&self) -> &Arc<MessageHandler> {
        &self.messages
    }

    pub fn ping_pong(&self) -> &Arc<PingPongHandler> {
        &self.ping_pong
    }

    pub fn blacklist(&self) -> &Arc<BlacklistHandler> {
        &self.blacklist
    }
}
