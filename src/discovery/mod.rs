//! Peer sidecars on the local network and the choice of primary.
//!
//! Every sidecar announces itself under [`SERVICE_NAME`] once it has content
//! to serve.  The primary is the announced name that sorts first; everyone
//! else syncs from it instead of the origin.

pub mod swarm;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::events::{Event, EventBus, PrimaryChanged};
use crate::types::PeerRecord;

pub use swarm::SwarmRegistry;

/// Service type shared by every sidecar.
pub const SERVICE_NAME: &str = "cimssc";

/// TXT attribute carrying the download path.
pub const PATH_ATTRIBUTE: &str = "path";

/// Announces the local sidecar and reports peers as
/// [`Event::PeerDiscovered`] / [`Event::PeerExpired`] on the bus.
pub trait ServiceRegistry: Send {
    /// Begin browsing for peers.
    fn start(&mut self, bus: EventBus) -> anyhow::Result<()>;

    /// Advertise the local service.
    fn register(&mut self, service: &LocalService) -> anyhow::Result<()>;

    fn stop(&mut self);
}

/// What this sidecar advertises.
#[derive(Debug, Clone)]
pub struct LocalService {
    pub name: String,
    pub port: u16,
    /// Path prefix content is served under, e.g. `/api/rest/mobiledb`.
    pub path: String,
    pub ips: Vec<IpAddr>,
}

impl LocalService {
    pub fn record(&self) -> PeerRecord {
        PeerRecord {
            name: self.name.clone(),
            port: self.port,
            urls: self
                .ips
                .iter()
                .map(|ip| peer_url(SocketAddr::new(*ip, self.port), &self.path))
                .collect(),
        }
    }
}

/// Download base of a peer reachable at `addr`.
pub fn peer_url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStatus {
    pub registered: bool,
    pub primary: Option<String>,
    pub is_primary: bool,
    pub peers: Vec<PeerRecord>,
}

pub struct PeerDiscovery {
    registry: Box<dyn ServiceRegistry>,
    service: LocalService,
    registered: bool,
    peers: BTreeMap<String, PeerRecord>,
    primary: Option<PeerRecord>,
    status: watch::Sender<PeerStatus>,
}

impl PeerDiscovery {
    pub fn new(registry: Box<dyn ServiceRegistry>, service: LocalService) -> Self {
        let (status, _) = watch::channel(PeerStatus::default());
        Self {
            registry,
            service,
            registered: false,
            peers: BTreeMap::new(),
            primary: None,
            status,
        }
    }

    pub fn start(&mut self, bus: EventBus) -> anyhow::Result<()> {
        info!("browsing for {SERVICE_NAME} peers as {}", self.service.name);
        self.registry.start(bus)
    }

    pub fn stop(&mut self) {
        debug!("stopping peer discovery");
        self.registry.stop();
    }

    pub fn status(&self) -> watch::Receiver<PeerStatus> {
        self.status.subscribe()
    }

    #[cfg(test)]
    pub fn primary(&self) -> Option<&PeerRecord> {
        self.primary.as_ref()
    }

    /// Advertise once, the first time any campaign has content to serve.
    pub fn on_content_ready(&mut self) -> Option<Event> {
        if self.registered {
            return None;
        }
        if let Err(e) = self.registry.register(&self.service) {
            warn!("failed to register {}: {e:#}", self.service.name);
            return None;
        }
        info!("registered {} on port {}", self.service.name, self.service.port);
        self.registered = true;
        self.update_primary()
    }

    pub fn on_peer_discovered(&mut self, peer: PeerRecord) -> Option<Event> {
        if peer.name == self.service.name {
            return None;
        }
        debug!("peer resolved: {} {:?}", peer.name, peer.urls);
        self.peers.insert(peer.name.clone(), peer);
        self.update_primary()
    }

    pub fn on_peer_expired(&mut self, name: &str) -> Option<Event> {
        self.peers.remove(name)?;
        debug!("peer removed: {name}");
        self.update_primary()
    }

    fn compute_primary(&self) -> Option<PeerRecord> {
        let local = self.registered.then(|| self.service.record());
        self.peers
            .values()
            .cloned()
            .chain(local)
            .min_by(|a, b| a.name.cmp(&b.name))
    }

    fn update_primary(&mut self) -> Option<Event> {
        let primary = self.compute_primary();
        let changed = primary != self.primary;
        self.primary = primary;
        self.publish_status();
        if !changed {
            return None;
        }

        let is_local = self
            .primary
            .as_ref()
            .map_or(true, |p| p.name == self.service.name);
        let url = match &self.primary {
            Some(p) if !is_local => p.urls.first().cloned(),
            _ => None,
        };
        let name = self.primary.as_ref().map(|p| p.name.clone());
        info!("primary is now {name:?} (local: {is_local})");
        Some(Event::PrimaryChanged(PrimaryChanged {
            is_local,
            name,
            url,
        }))
    }

    fn publish_status(&self) {
        self.status.send_replace(PeerStatus {
            registered: self.registered,
            primary: self.primary.as_ref().map(|p| p.name.clone()),
            is_primary: self
                .primary
                .as_ref()
                .is_some_and(|p| p.name == self.service.name),
            peers: self.peers.values().cloned().collect(),
        });
    }
}
