//! Ping-Pong liveness handler
//!
//! Per peer it tracks the time of the last received message and at most
//! one outstanding ping. A periodic check:
//! - sends a ping with a fresh random nonce to peers idle for longer than
//!   the inactivity timeout
//! - requests disconnection of peers that did not answer a ping within the
//!   response timeout, then resets their probe
//!
//! Inbound pings are always answered with a pong carrying the same nonce.
//! Disabling a peer suspends the checks but not the message processing.

use crate::config::duration_millis;
use crate::events::{Event, EventBus, EventKind};
use crate::network::PeerAddress;
use crate::wire::{BitcoinMsg, Message, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingPongConfig {
    /// Time allowed for the pong after a ping was sent
    #[serde(with = "duration_millis")]
    pub response_timeout: Duration,
    /// Idle time after which a peer is probed
    #[serde(with = "duration_millis")]
    pub inactivity_timeout: Duration,
    /// Period of the timeout checks
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
}

impl Default for PingPongConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(120),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Liveness record of one peer
#[derive(Debug, Clone)]
pub struct PingPongPeerInfo {
    peer: PeerAddress,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
    ping_nonce: Option<u64>,
    disabled: bool,
}

impl PingPongPeerInfo {
    pub fn new(peer: PeerAddress, now: Instant) -> Self {
        Self {
            peer,
            last_activity: now,
            ping_sent_at: None,
            ping_nonce: None,
            disabled: false,
        }
    }

    /// Back to idle: no probe outstanding
    pub fn reset(&mut self) {
        self.ping_sent_at = None;
        self.ping_nonce = None;
    }

    pub fn update_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn update_ping_started(&mut self, nonce: u64, now: Instant) {
        self.ping_sent_at = Some(now);
        self.ping_nonce = Some(nonce);
    }

    pub fn enable(&mut self) {
        self.disabled = false;
    }

    pub fn disable(&mut self) {
        self.disabled = true;
        self.reset();
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn ping_sent_at(&self) -> Option<Instant> {
        self.ping_sent_at
    }

    pub fn ping_nonce(&self) -> Option<u64> {
        self.ping_nonce
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PingPongHandlerState {
    pub peers: usize,
    pub pings_sent: u64,
    pub pongs_sent: u64,
    pub timeouts: u64,
}

enum Action {
    Ping(PeerAddress, u64),
    Timeout(PeerAddress),
}

pub struct PingPongHandler {
    bus: EventBus,
    magic: u32,
    config: PingPongConfig,
    peers: RwLock<HashMap<PeerAddress, Arc<Mutex<PingPongPeerInfo>>>>,
    /// Peers whose disconnection arrived before their `PeerMsgReady`
    departed: Mutex<HashMap<PeerAddress, Instant>>,
    state: Mutex<PingPongHandlerState>,
}

impl PingPongHandler {
    pub fn new(bus: EventBus, magic: u32, config: PingPongConfig) -> Arc<Self> {
        let handler = Arc::new(Self {
            bus,
            magic,
            config,
            peers: RwLock::new(HashMap::new()),
            departed: Mutex::new(HashMap::new()),
            state: Mutex::new(PingPongHandlerState::default()),
        });
        handler.register_for_events();
        handler
    }

    fn register_for_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.subscribe(&weak, EventKind::PeerMsgReady, |h, event| {
            if let Event::PeerMsgReady { peer } = event {
                h.add_peer(*peer);
            }
        });
        self.subscribe(&weak, EventKind::PeerDisconnected, |h, event| {
            if let Event::PeerDisconnected { peer, .. } = event {
                h.remove_peer(peer);
            }
        });
        // Parts of a streamed block count as traffic too
        for kind in [
            EventKind::AnyMsgReceived,
            EventKind::PartialBlockHeaderReceived,
            EventKind::PartialBlockTxsReceived,
        ] {
            self.subscribe(&weak, kind, |h, event| {
                if let Some(peer) = event.peer() {
                    h.with_peer(&peer, |info| info.update_activity(Instant::now()));
                }
            });
        }
        self.subscribe(&weak, EventKind::MsgReceived(MessageType::Ping), |h, event| {
            if let Event::MsgReceived { peer, msg } = event {
                if let Message::Ping(nonce) = msg.body {
                    h.on_ping(*peer, nonce);
                }
            }
        });
        self.subscribe(&weak, EventKind::MsgReceived(MessageType::Pong), |h, event| {
            if let Event::MsgReceived { peer, msg } = event {
                if let Message::Pong(nonce) = msg.body {
                    h.on_pong(peer, nonce);
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

    pub fn config(&self) -> &PingPongConfig {
        &self.config
    }

    /// Run [`PingPongHandler::check_peers`] every `check_interval` until the
    /// handler is dropped or the task aborted
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(handler) => handler.check_peers(Instant::now()),
                    None => break,
                }
            }
        })
    }

    pub fn add_peer(&self, peer: PeerAddress) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.contains_key(&peer) {
            return;
        }
        // Pooled dispatch may deliver the disconnection first
        let departed = self
            .departed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer)
            .is_some();
        if departed {
            log::trace!("[{}] Already disconnected, not tracked", peer);
            return;
        }
        peers.insert(
            peer,
            Arc::new(Mutex::new(PingPongPeerInfo::new(peer, Instant::now()))),
        );
        drop(peers);
        self.update_state(|s| s.peers += 1);
    }

    pub fn remove_peer(&self, peer: &PeerAddress) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.remove(peer).is_some() {
            drop(peers);
            self.update_state(|s| s.peers = s.peers.saturating_sub(1));
        } else {
            self.departed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(*peer, Instant::now());
        }
    }

    pub fn enable_ping_pong(&self, peer: &PeerAddress) {
        self.with_peer(peer, PingPongPeerInfo::enable);
    }

    pub fn disable_ping_pong(&self, peer: &PeerAddress) {
        self.with_peer(peer, PingPongPeerInfo::disable);
    }

    /// Copy of the liveness record of `peer`
    pub fn peer_info(&self, peer: &PeerAddress) -> Option<PingPongPeerInfo> {
        let info = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()?;
        let info = info.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(info)
    }

    pub fn state(&self) -> PingPongHandlerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One pass of the timeout checks, as of `now`
    pub fn check_peers(&self, now: Instant) {
        // A disconnection whose `PeerMsgReady` never came is forgotten
        self.departed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, at| now.saturating_duration_since(*at) < self.config.response_timeout);

        let peers: Vec<Arc<Mutex<PingPongPeerInfo>>> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut actions = Vec::new();
        for info in peers {
            let mut info = info.lock().unwrap_or_else(PoisonError::into_inner);
            if info.disabled {
                continue;
            }
            match info.ping_sent_at {
                Some(sent) if now.saturating_duration_since(sent) >= self.config.response_timeout => {
                    info.reset();
                    actions.push(Action::Timeout(info.peer));
                }
                Some(_) => {}
                None => {
                    let idle = now.saturating_duration_since(info.last_activity);
                    if idle >= self.config.inactivity_timeout {
                        let nonce = rand::random::<u64>();
                        info.update_ping_started(nonce, now);
                        actions.push(Action::Ping(info.peer, nonce));
                    }
                }
            }
        }

        // Published with no record locked
        for action in actions {
            match action {
                Action::Ping(peer, nonce) => {
                    log::trace!("[{}] Inactive, sending ping {}", peer, nonce);
                    self.update_state(|s| s.pings_sent += 1);
                    self.bus.publish(Event::SendMsgRequest {
                        peer,
                        msg: BitcoinMsg::new(self.magic, Message::Ping(nonce)),
                    });
                }
                Action::Timeout(peer) => {
                    log::debug!("[{}] Ping/pong timeout, requesting disconnection", peer);
                    self.update_state(|s| s.timeouts += 1);
                    self.bus.publish(Event::DisconnectPeerRequest { peer, reason: None });
                }
            }
        }
    }

    fn on_ping(&self, peer: PeerAddress, nonce: u64) {
        self.update_state(|s| s.pongs_sent += 1);
        self.bus.publish(Event::SendMsgRequest {
            peer,
            msg: BitcoinMsg::new(self.magic, Message::Pong(nonce)),
        });
    }

    fn on_pong(&self, peer: &PeerAddress, nonce: u64) {
        self.with_peer(peer, |info| {
            if info.ping_nonce == Some(nonce) {
                info.reset();
            } else {
                log::trace!("[{}] Ignoring pong with unexpected nonce {}", peer, nonce);
            }
        });
    }

    fn with_peer<F: FnOnce(&mut PingPongPeerInfo)>(&self, peer: &PeerAddress, f: F) {
        let info = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned();
        if let Some(info) = info {
            f(&mut info.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn update_state<F: FnOnce(&mut PingPongHandlerState)>(&self, f: F) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = *state;
        f(&mut next);
        *state = next;
    }
}
