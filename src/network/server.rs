//! TCP listener and outbound dialing

use crate::network::peer::{NetworkError, PeerAddress};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `addr`. Port 0 picks a free port, see [`Server::local_addr`].
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> Result<(TcpStream, PeerAddress), NetworkError> {
        let (stream, addr) = self.listener.accept().await?;
        configure(&stream);
        Ok((stream, PeerAddress::from(addr)))
    }
}

/// Connect to a peer, giving up after `timeout`
pub async fn connect_to_peer(
    peer: PeerAddress,
    timeout: Duration,
) -> Result<TcpStream, NetworkError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(peer.socket_addr()))
        .await
        .map_err(|_| NetworkError::Timeout(peer))?
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", peer, e)))?;
    configure(&stream);
    Ok(stream)
}

fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Could not set TCP_NODELAY: {}", e);
    }
}
