//! Handle to one established peer connection
//!
//! The network layer creates a [`PeerConnection`] per socket and hands it
//! over in a `PeerStreamConnected` event. The socket itself can be taken
//! exactly once (by whoever wraps it in a message stream); the close
//! signal stays shared so either side can end the connection.

use crate::network::peer::{DisconnectReason, PeerAddress};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Byte transport of a peer connection (a TCP socket, or an in-memory
/// pipe in tests)
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerIo for T {}

pub type BoxedIo = Box<dyn PeerIo>;

#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    peer: PeerAddress,
    inbound: bool,
    io: Mutex<Option<BoxedIo>>,
    close_reason: Mutex<Option<DisconnectReason>>,
    closed_tx: watch::Sender<bool>,
}

impl PeerConnection {
    pub fn new<T: PeerIo>(peer: PeerAddress, io: T, inbound: bool) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                peer,
                inbound,
                io: Mutex::new(Some(Box::new(io))),
                close_reason: Mutex::new(None),
                closed_tx,
            }),
        }
    }

    pub fn peer(&self) -> PeerAddress {
        self.inner.peer
    }

    pub fn is_inbound(&self) -> bool {
        self.inner.inbound
    }

    /// True if both handles refer to the same connection
    pub fn same_as(&self, other: &PeerConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take the socket. Returns `None` if it was already taken.
    pub fn take_io(&self) -> Option<BoxedIo> {
        self.inner
            .io
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the connection. Only the first call records its reason and
    /// returns `true`; later calls are no-ops.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        {
            let mut slot = self
                .inner
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        // Drop the socket if nobody took it yet
        drop(self.take_io());
        self.inner.closed_tx.send_replace(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self
            .inner
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver that flips to `true` once the connection is closed
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Resolves once [`PeerConnection::close`] has been called
    pub async fn wait_closed(&self) {
        let mut signal = self.closed_signal();
        // Err only if the sender is gone, which cannot happen while `self` holds it
        let _ = signal.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.inner.peer)
            .field("inbound", &self.inner.inbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddress {
        "127.0.0.1:8333".parse().unwrap()
    }

    #[tokio::test]
    async fn test_io_taken_once() {
        let (io, _other) = tokio::io::duplex(64);
        let conn = PeerConnection::new(peer(), io, true);
        assert!(conn.take_io().is_some());
        assert!(conn.take_io().is_none());
        assert!(conn.same_as(&conn.clone()));
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (io, _other) = tokio::io::duplex(64);
        let conn = PeerConnection::new(peer(), io, false);
        assert!(!conn.is_closed());

        assert!(conn.close(DisconnectReason::Local));
        assert!(!conn.close(DisconnectReason::Remote));
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(DisconnectReason::Local));

        // Already closed: resolves immediately
        conn.wait_closed().await;
    }

    #[tokio::test]
    async fn test_wait_closed_wakes_up() {
        let (io, _other) = tokio::io::duplex(64);
        let conn = PeerConnection::new(peer(), io, false);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_closed().await })
        };
        conn.close(DisconnectReason::Remote);
        waiter.await.unwrap();
    }
}
