//! The event bus and the single consumer that drives every state change.
//!
//! Producers (the discovery listener, schedulers, the HTTP surface and the
//! handlers themselves) publish onto an unbounded queue.  One dispatcher
//! task drains it in order and runs exactly one handler at a time, so the
//! components it owns never need locks.  Follow-up events returned by a
//! handler are appended to the tail of the queue.

use std::fmt;
use std::path::PathBuf;

use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};

use crate::content::ContentSync;
use crate::directory::CampaignDirectory;
use crate::discovery::PeerDiscovery;
use crate::types::{Campaign, CampaignMap, Content, PeerRecord};

#[derive(Debug)]
pub enum Event {
    /// Fetch the campaign list from the origin.
    RefreshCampaigns,
    CampaignsUpdated {
        old: CampaignMap,
        new: CampaignMap,
    },
    /// Scheduled or explicit request; `None` targets every known campaign.
    RequestUpdate {
        campaign: Option<String>,
    },
    ContentMissing(Campaign),
    UpdateRequested {
        campaign: Campaign,
        existing: Option<Content>,
    },
    MetadataFetched {
        campaign: Campaign,
        metadata: PathBuf,
    },
    DatabaseFetched {
        campaign: Campaign,
        database: PathBuf,
        metadata: PathBuf,
    },
    ContentAvailable {
        campaign: Campaign,
        content: PathBuf,
        metadata: PathBuf,
    },
    ContentVerified {
        campaign: Campaign,
        content: Content,
    },
    ContentReady {
        campaign: Campaign,
        content: Content,
    },
    SyncFailure(SyncFailure),
    SyncUnnecessary(Campaign),
    PeerDiscovered(PeerRecord),
    PeerExpired(String),
    PrimaryChanged(PrimaryChanged),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RefreshCampaigns => "RefreshCampaigns",
            Event::CampaignsUpdated { .. } => "CampaignsUpdated",
            Event::RequestUpdate { .. } => "RequestUpdate",
            Event::ContentMissing(_) => "ContentMissing",
            Event::UpdateRequested { .. } => "UpdateRequested",
            Event::MetadataFetched { .. } => "MetadataFetched",
            Event::DatabaseFetched { .. } => "DatabaseFetched",
            Event::ContentAvailable { .. } => "ContentAvailable",
            Event::ContentVerified { .. } => "ContentVerified",
            Event::ContentReady { .. } => "ContentReady",
            Event::SyncFailure(_) => "SyncFailure",
            Event::SyncUnnecessary(_) => "SyncUnnecessary",
            Event::PeerDiscovered(_) => "PeerDiscovered",
            Event::PeerExpired(_) => "PeerExpired",
            Event::PrimaryChanged(_) => "PrimaryChanged",
        }
    }
}

/// Terminal failure of one campaign's pipeline.
pub struct SyncFailure {
    pub campaign: Campaign,
    pub message: String,
    pub cause: Option<anyhow::Error>,
    /// Files to delete, best-effort.
    pub cleanup: Vec<PathBuf>,
}

impl SyncFailure {
    pub fn new(campaign: Campaign, message: impl Into<String>) -> Self {
        Self {
            campaign,
            message: message.into(),
            cause: None,
            cleanup: Vec::new(),
        }
    }

    pub fn caused_by(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn cleanup(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.cleanup.extend(paths);
        self
    }
}

impl fmt::Debug for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncFailure")
            .field("campaign", &self.campaign.id)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| format!("{c:#}")))
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl From<SyncFailure> for Event {
    fn from(failure: SyncFailure) -> Self {
        Event::SyncFailure(failure)
    }
}

/// The preferred sync source changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryChanged {
    pub is_local: bool,
    pub name: Option<String>,
    /// First advertised URL of the primary when it is a remote peer.
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            warn!("event bus closed, dropping {}", e.0.name());
        }
    }
}

/// Owns every stateful component and routes each event to its handler.
pub struct Dispatcher {
    content: ContentSync,
    directory: CampaignDirectory,
    peers: Option<PeerDiscovery>,
    bus: EventBus,
}

impl Dispatcher {
    pub fn new(
        content: ContentSync,
        directory: CampaignDirectory,
        peers: Option<PeerDiscovery>,
        bus: EventBus,
    ) -> Self {
        Self {
            content,
            directory,
            peers,
            bus,
        }
    }

    #[cfg(test)]
    pub fn content(&self) -> &ContentSync {
        &self.content
    }

    /// Drain the queue until `shutdown` fires, then withdraw from the
    /// network.
    ///
    /// The dispatcher holds a sender of its own, so the queue never closes
    /// while it runs. A dropped `shutdown` sender counts as a signal.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Event>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("dispatcher shutting down");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    for follow_up in self.dispatch(event).await {
                        self.bus.publish(follow_up);
                    }
                }
            }
        }
        if let Some(peers) = self.peers.as_mut() {
            peers.stop();
        }
    }

    /// Run the handler for one event and return the events it produced.
    pub async fn dispatch(&mut self, event: Event) -> Vec<Event> {
        debug!("dispatching {}", event.name());
        match event {
            Event::RefreshCampaigns => match self.directory.refresh().await {
                Ok(update) => update.into_iter().collect(),
                Err(e) => {
                    error!("campaign refresh failed: {e:#}");
                    Vec::new()
                }
            },
            Event::CampaignsUpdated { old, new } => {
                self.content.on_campaigns_updated(&old, &new).await
            }
            Event::RequestUpdate { campaign } => self.content.request_updates(campaign.as_deref()),
            Event::ContentMissing(campaign) => {
                self.content.request_update(&campaign).into_iter().collect()
            }
            Event::UpdateRequested { campaign, existing } => {
                vec![self.content.on_update_requested(campaign, existing).await]
            }
            Event::MetadataFetched { campaign, metadata } => {
                vec![self.content.on_metadata_fetched(campaign, metadata).await]
            }
            Event::DatabaseFetched {
                campaign,
                database,
                metadata,
            } => vec![self.content.on_database_fetched(campaign, database, metadata)],
            Event::ContentAvailable {
                campaign,
                content,
                metadata,
            } => vec![self.content.on_content_available(campaign, content, metadata).await],
            Event::ContentVerified { campaign, content } => self
                .content
                .on_content_verified(campaign, content)
                .await
                .into_iter()
                .collect(),
            Event::ContentReady { campaign, content } => {
                self.content.on_content_ready(campaign, content);
                self.peers
                    .as_mut()
                    .and_then(PeerDiscovery::on_content_ready)
                    .into_iter()
                    .collect()
            }
            Event::SyncFailure(failure) => {
                self.content.on_sync_failure(failure).await;
                Vec::new()
            }
            Event::SyncUnnecessary(campaign) => {
                self.content.on_sync_unnecessary(&campaign);
                Vec::new()
            }
            Event::PeerDiscovered(peer) => self
                .peers
                .as_mut()
                .and_then(|p| p.on_peer_discovered(peer))
                .into_iter()
                .collect(),
            Event::PeerExpired(name) => self
                .peers
                .as_mut()
                .and_then(|p| p.on_peer_expired(&name))
                .into_iter()
                .collect(),
            Event::PrimaryChanged(primary) => {
                self.content.on_primary_changed(&primary);
                Vec::new()
            }
        }
    }
}
