//! Campaign sidecar entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};

mod codec;
mod config;
mod content;
mod directory;
mod discovery;
mod events;
mod fetch;
mod layout;
mod server;
mod stats;
mod types;

#[cfg(test)]
mod testutil;

use config::Config;
use content::ContentSync;
use directory::CampaignDirectory;
use discovery::swarm::advertised_ips;
use discovery::{LocalService, PeerDiscovery, SwarmRegistry};
use events::{Dispatcher, Event, EventBus};
use fetch::FetchClient;
use layout::StorageLayout;
use server::AppState;
use stats::Counters;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting sidecar {} with origin {}, data in {}",
        cfg.node_name,
        cfg.download_url,
        cfg.data_dir.display()
    );
    tokio::fs::create_dir_all(&cfg.data_dir).await?;

    let (bus, rx) = EventBus::new();
    let counters = Arc::new(Counters::default());
    let client = FetchClient::new(cfg.connect_timeout(), cfg.fetch_timeout())?;

    let content = ContentSync::new(
        StorageLayout::new(&cfg.data_dir),
        client.clone(),
        cfg.download_url.clone(),
        cfg.credentials(),
        counters.clone(),
    );
    let directory = CampaignDirectory::new(
        client.http().clone(),
        cfg.campaigns_url.clone(),
        cfg.credentials(),
    );

    // The bound port is what peers are told to connect to.
    let listener = TcpListener::bind(cfg.http_bind).await?;
    let port = listener.local_addr()?.port();

    // Peer Discovery
    let peers = if cfg.zeroconf {
        let service = LocalService {
            name: cfg.node_name.clone(),
            port,
            path: cfg.download_path.clone(),
            ips: advertised_ips(&cfg.advertise_ips),
        };
        let registry = SwarmRegistry::new(cfg.node_name.clone(), tokio::runtime::Handle::current());
        let mut peers = PeerDiscovery::new(Box::new(registry), service);
        match peers.start(bus.clone()) {
            Ok(()) => Some(peers),
            Err(e) => {
                error!("Peer discovery unavailable, syncing from origin only: {e:#}");
                None
            }
        }
    } else {
        None
    };

    // HTTP Server
    let state = AppState {
        content: content.view(),
        bus: bus.clone(),
        counters,
        peers: peers.as_ref().map(PeerDiscovery::status),
    };
    let app = server::router(state, &cfg.download_path);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app).await {
            error!("HTTP server failed: {e:#}");
        }
    });

    // Campaign refresh, immediately and then on schedule
    let campaigns_bus = bus.clone();
    let mut campaigns_tick = time::interval(cfg.campaigns_interval());
    campaigns_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let campaigns_handle = tokio::spawn(async move {
        loop {
            campaigns_tick.tick().await;
            campaigns_bus.publish(Event::RefreshCampaigns);
        }
    });

    // Scheduled updates
    let updates_bus = bus.clone();
    let mut updates_tick = time::interval_at(
        Instant::now() + cfg.update_initial_delay(),
        cfg.update_interval(),
    );
    updates_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let updates_handle = tokio::spawn(async move {
        loop {
            updates_tick.tick().await;
            updates_bus.publish(Event::RequestUpdate { campaign: None });
        }
    });

    let dispatcher = Dispatcher::new(content, directory, peers, bus);
    let (stop, shutdown) = oneshot::channel();
    let mut dispatcher_handle = tokio::spawn(dispatcher.run(rx, shutdown));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Stop producing, then let the dispatcher finish its current handler and
    // withdraw the mdns announcement.
    campaigns_handle.abort();
    updates_handle.abort();
    server_handle.abort();
    let _ = stop.send(());
    if time::timeout(Duration::from_secs(10), &mut dispatcher_handle)
        .await
        .is_err()
    {
        error!("Dispatcher did not stop in time, aborting");
        dispatcher_handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
