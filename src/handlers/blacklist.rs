//! Blacklist handler
//!
//! Counts disconnect requests that carry a reason (protocol violations)
//! per host. A host reaching the threshold is banned and announced with
//! `PeersBlacklisted`; the network layer then refuses it. `whitelist`
//! lifts a ban and announces it with `PeersWhitelisted`.

use crate::events::{Event, EventBus, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Violations after which a host is banned
    pub threshold: u32,
    /// Hosts that are never banned
    pub trusted: Vec<IpAddr>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            trusted: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlacklistHandlerState {
    pub violations: u64,
    pub hosts_blacklisted: usize,
}

#[derive(Default)]
struct Registry {
    violations: HashMap<IpAddr, u32>,
    banned: HashSet<IpAddr>,
    total_violations: u64,
}

pub struct BlacklistHandler {
    bus: EventBus,
    config: BlacklistConfig,
    registry: Mutex<Registry>,
}

impl BlacklistHandler {
    pub fn new(bus: EventBus, config: BlacklistConfig) -> Arc<Self> {
        let handler = Arc::new(Self {
            bus,
            config,
            registry: Mutex::new(Registry::default()),
        });

        let weak = Arc::downgrade(&handler);
        handler
            .bus
            .subscribe(EventKind::DisconnectPeerRequest, move |event| {
                if let (Some(h), Event::DisconnectPeerRequest { peer, reason: Some(reason) }) =
                    (weak.upgrade(), event)
                {
                    h.record_violation(peer.ip(), reason);
                }
            });
        let weak = Arc::downgrade(&handler);
        handler.bus.subscribe(EventKind::PeersWhitelisted, move |event| {
            if let (Some(h), Event::PeersWhitelisted { hosts }) = (weak.upgrade(), event) {
                h.lift(hosts);
            }
        });
        handler
    }

    /// Count one violation by `host`, banning it once the threshold is hit
    pub fn record_violation(&self, host: IpAddr, reason: &str) {
        if self.config.trusted.contains(&host) {
            log::debug!("Ignoring violation by trusted host {}: {}", host, reason);
            return;
        }
        let banned_now = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.total_violations += 1;
            let count = registry.violations.entry(host).or_insert(0);
            *count += 1;
            let count = *count;
            log::debug!("Host {} violation #{}: {}", host, count, reason);
            count >= self.config.threshold && registry.banned.insert(host)
        };
        if banned_now {
            log::info!("Blacklisting host {}", host);
            self.bus.publish(Event::PeersBlacklisted { hosts: vec![host] });
        }
    }

    /// Ban `host` right away
    pub fn blacklist(&self, host: IpAddr) {
        let inserted = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .banned
            .insert(host);
        if inserted {
            log::info!("Blacklisting host {}", host);
            self.bus.publish(Event::PeersBlacklisted { hosts: vec![host] });
        }
    }

    /// Lift the ban on `host` and forget its violations
    pub fn whitelist(&self, host: IpAddr) {
        if self.lift(&[host]) {
            self.bus.publish(Event::PeersWhitelisted { hosts: vec![host] });
        }
    }

    fn lift(&self, hosts: &[IpAddr]) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let mut lifted = false;
        for host in hosts {
            registry.violations.remove(host);
            if registry.banned.remove(host) {
                log::info!("Whitelisting host {}", host);
                lifted = true;
            }
        }
        lifted
    }

    pub fn is_blacklisted(&self, host: &IpAddr) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .banned
            .contains(host)
    }

    pub fn blacklisted(&self) -> Vec<IpAddr> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .banned
            .iter()
            .copied()
            .collect()
    }

    pub fn state(&self) -> BlacklistHandlerState {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        BlacklistHandlerState {
            violations: registry.total_violations,
            hosts_blacklisted: registry.banned.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DispatchMode;
    use crate::network::PeerAddress;
    use std::sync::mpsc;

    fn setup(threshold: u32) -> (EventBus, Arc<BlacklistHandler>, mpsc::Receiver<Vec<IpAddr>>) {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = BlacklistHandler::new(
            bus.clone(),
            BlacklistConfig {
                threshold,
                trusted: vec!["127.0.0.1".parse().unwrap()],
            },
        );
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        bus.subscribe(EventKind::PeersBlacklisted, move |event| {
            if let Event::PeersBlacklisted { hosts } = event {
                let _ = tx.lock().unwrap().send(hosts.clone());
            }
        });
        (bus, handler, rx)
    }

    fn violation(bus: &EventBus, addr: &str, reason: Option<&str>) {
        bus.publish(Event::DisconnectPeerRequest {
            peer: addr.parse::<PeerAddress>().unwrap(),
            reason: reason.map(str::to_string),
        });
    }

    #[test]
    fn test_banned_after_threshold() {
        let (bus, handler, banned) = setup(2);
        let host: IpAddr = "10.0.0.5".parse().unwrap();

        violation(&bus, "10.0.0.5:8333", Some("bad magic"));
        assert!(!handler.is_blacklisted(&host));
        // Same host, other port: still the same host
        violation(&bus, "10.0.0.5:9999", Some("bad checksum"));
        assert!(handler.is_blacklisted(&host));
        assert_eq!(banned.try_recv().unwrap(), vec![host]);

        // Further violations don't announce it again
        violation(&bus, "10.0.0.5:8333", Some("bad magic"));
        assert!(banned.try_recv().is_err());
        assert_eq!(handler.state().violations, 3);
    }

    #[test]
    fn test_requests_without_reason_not_counted() {
        let (bus, handler, _banned) = setup(1);
        violation(&bus, "10.0.0.5:8333", None);
        assert_eq!(handler.state(), BlacklistHandlerState::default());
    }

    #[test]
    fn test_trusted_host_never_banned() {
        let (bus, handler, _banned) = setup(1);
        violation(&bus, "127.0.0.1:8333", Some("bad magic"));
        assert!(handler.blacklisted().is_empty());
    }

    #[test]
    fn test_whitelist_lifts_ban() {
        let (bus, handler, _banned) = setup(1);
        let host: IpAddr = "10.0.0.6".parse().unwrap();
        violation(&bus, "10.0.0.6:8333", Some("bad magic"));
        assert!(handler.is_blacklisted(&host));

        handler.whitelist(host);
        assert!(!handler.is_blacklisted(&host));

        handler.blacklist(host);
        bus.publish(Event::PeersWhitelisted { hosts: vec![host] });
        assert!(!handler.is_blacklisted(&host));
    }
}
