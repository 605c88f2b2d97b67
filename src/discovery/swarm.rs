//! mDNS registry backed by `swarm-discovery`.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use anyhow::anyhow;
use log::{debug, warn};
use swarm_discovery::{Discoverer, DropGuard, IpClass, Peer};
use tokio::runtime::Handle;

use super::{peer_url, LocalService, ServiceRegistry, PATH_ATTRIBUTE, SERVICE_NAME};
use crate::events::{Event, EventBus};
use crate::types::PeerRecord;

pub struct SwarmRegistry {
    name: String,
    runtime: Handle,
    guard: Option<DropGuard>,
}

impl SwarmRegistry {
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            runtime,
            guard: None,
        }
    }
}

impl ServiceRegistry for SwarmRegistry {
    /// Browse with no addresses; [`register`](Self::register) adds them later.
    fn start(&mut self, bus: EventBus) -> anyhow::Result<()> {
        let callback = move |peer_id: &str, peer: &Peer| {
            if peer.is_expiry() {
                bus.publish(Event::PeerExpired(peer_id.to_string()));
            } else {
                bus.publish(Event::PeerDiscovered(to_record(peer_id, peer)));
            }
        };
        let guard = Discoverer::new_interactive(SERVICE_NAME.to_string(), self.name.clone())
            .with_callback(callback)
            .with_ip_class(IpClass::Auto)
            .spawn(&self.runtime)
            .map_err(|e| anyhow!("failed to start mdns discovery: {e:#}"))?;
        self.guard = Some(guard);
        Ok(())
    }

    fn register(&mut self, service: &LocalService) -> anyhow::Result<()> {
        let guard = self
            .guard
            .as_mut()
            .ok_or_else(|| anyhow!("mdns discovery not started"))?;
        guard.add(service.port, service.ips.clone());
        guard
            .set_txt_attribute(PATH_ATTRIBUTE.to_string(), Some(service.path.clone()))
            .map_err(|e| anyhow!("failed to set {PATH_ATTRIBUTE} attribute: {e:?}"))?;
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the guard withdraws the announcement.
        self.guard.take();
    }
}

fn to_record(peer_id: &str, peer: &Peer) -> PeerRecord {
    let path = match peer.txt_attribute(PATH_ATTRIBUTE) {
        Some(Some(path)) => path.to_string(),
        _ => {
            debug!("{peer_id} announced without a {PATH_ATTRIBUTE} attribute");
            String::new()
        }
    };
    let addrs: Vec<SocketAddr> = peer
        .addrs()
        .iter()
        .map(|(ip, port)| SocketAddr::new(*ip, *port))
        .collect();
    PeerRecord {
        name: peer_id.to_string(),
        port: addrs.first().map_or(0, SocketAddr::port),
        urls: addrs.into_iter().map(|addr| peer_url(addr, &path)).collect(),
    }
}

/// Addresses to advertise: the configured ones, else the address the
/// default route leaves from.
pub fn advertised_ips(configured: &[IpAddr]) -> Vec<IpAddr> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    match outbound_ip() {
        Ok(ip) => vec![ip],
        Err(e) => {
            warn!("could not determine a local address to advertise: {e}");
            Vec::new()
        }
    }
}

fn outbound_ip() -> std::io::Result<IpAddr> {
    // Connecting a UDP socket sends nothing; it only selects a route.
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("192.0.2.1:9")?;
    Ok(socket.local_addr()?.ip())
}
