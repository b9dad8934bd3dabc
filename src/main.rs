//! Blockwire CLI
//!
//! Runs a node that logs what its peers send, or decodes a single wire
//! message.

use blockwire::config::Network;
use blockwire::events::{Event, EventKind};
use blockwire::network::PeerAddress;
use blockwire::node::{Node, NodeConfig};
use blockwire::wire::{BitcoinMsg, Message, MessageType, NetAddr, ServiceFlags, VersionMessage};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "blockwire")]
#[command(version)]
#[command(about = "Peer-to-peer networking core for a Bitcoin-style node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Node {
        /// mainnet, testnet, stn or regtest
        #[arg(short, long, default_value = "mainnet")]
        network: Network,

        /// Port to listen on (defaults to the network's port)
        #[arg(short, long)]
        listen: Option<u16>,

        /// Peer to connect to, can be repeated
        #[arg(short, long)]
        connect: Vec<SocketAddr>,

        /// JSON config file. --listen and --connect are applied on top of it
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Decode one hex-encoded wire message
    Decode {
        /// Header followed by body, as hex
        hex: String,

        #[arg(short, long, default_value = "mainnet")]
        network: Network,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node {
            network,
            listen,
            connect,
            config,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(path)?,
                None => NodeConfig::for_network(network),
            };
            if let Some(port) = listen {
                node_config.network.listen_address = Some(SocketAddr::from(([0, 0, 0, 0], port)));
            }
            node_config.bootstrap_peers.extend(connect);
            run_node(node_config)
        }
        Commands::Decode { hex, network } => decode(&hex, network),
    }
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let node = Arc::new(Node::new(config)?);
        install_demo_handlers(&node);

        println!("Starting {} node...", node.config().protocol.network);
        node.start().await?;

        tokio::signal::ctrl_c().await?;
        println!("\nShutting down node...");
        node.stop();

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Log every message and answer `version` with `verack`, so remote nodes
/// keep the connection open
fn install_demo_handlers(node: &Arc<Node>) {
    node.subscribe(EventKind::AnyMsgReceived, |event| {
        if let Event::MsgReceived { peer, msg } = event {
            log::info!("[{}] Received {} ({} bytes)", peer, msg.message_type(), msg.header.length);
        }
    });

    let weak = Arc::downgrade(node);
    node.subscribe(EventKind::PeerMsgReady, move |event| {
        if let (Some(node), Event::PeerMsgReady { peer }) = (weak.upgrade(), event) {
            node.send(*peer, version_message(&node, *peer));
        }
    });

    let weak = Arc::downgrade(node);
    node.subscribe(EventKind::MsgReceived(MessageType::Version), move |event| {
        if let (Some(node), Event::MsgReceived { peer, msg }) = (weak.upgrade(), event) {
            if let Message::Version(version) = &msg.body {
                log::info!(
                    "[{}] Version {} {}",
                    peer,
                    version.version,
                    version.user_agent
                );
            }
            node.send(*peer, Message::VerAck);
        }
    });
}

fn version_message(node: &Node, peer: PeerAddress) -> Message {
    let protocol = &node.config().protocol;
    Message::Version(VersionMessage {
        version: protocol.protocol_version,
        services: protocol.services,
        timestamp: chrono::Utc::now().timestamp(),
        addr_recv: NetAddr::new(peer.socket_addr(), ServiceFlags::empty()),
        addr_from: NetAddr::unspecified(),
        nonce: rand::random(),
        user_agent: protocol.user_agent.clone(),
        start_height: 0,
        relay: Some(false),
    })
}

fn decode(input: &str, network: Network) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = hex::decode(input.trim())?;
    let msg = BitcoinMsg::from_bytes(&bytes, network.magic())?;

    println!("Command:  {}", msg.header.command);
    println!("Magic:    {:#010x} ({})", msg.header.magic, network);
    println!("Length:   {}", msg.header.length);
    println!("Checksum: {}", hex::encode(msg.header.checksum));
    println!("{:#?}", msg.body);
    Ok(())
}
