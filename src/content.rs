//! Per-campaign content lifecycle.
//!
//! ```text
//! ContentMissing / RequestUpdate
//!   -> UpdateRequested -> SyncUnnecessary
//!                      -> MetadataFetched -> ContentAvailable
//!                      -> DatabaseFetched -> ContentAvailable
//!   ContentAvailable -> ContentVerified -> ContentReady
//! any step -> SyncFailure
//! ```
//!
//! Handlers run one at a time on the dispatcher task.  The update token
//! keeps at most one pipeline in flight per campaign; the verified map is
//! republished as an immutable snapshot whenever it changes.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use log::{debug, info, warn};
use reqwest::StatusCode;
use tokio::sync::watch;
use url::Url;

use crate::codec::metadata::CAPTURE_BLOCK_SIZE;
use crate::codec::{
    self, hash_file, CodecError, HashAlgorithm, Metadata, MetadataCapture, DB_MEDIATYPE,
    METADATA_MEDIATYPE,
};
use crate::events::{Event, PrimaryChanged, SyncFailure};
use crate::fetch::{Credentials, FetchClient, Request};
use crate::layout::StorageLayout;
use crate::stats::{Counter, Counters};
use crate::types::{Campaign, CampaignMap, Content, UpdateToken};

/// Verified content keyed by campaign identifier.
pub type VerifiedContent = BTreeMap<String, Content>;

/// Read-only access to the latest published verified content.
///
/// Each call observes one complete snapshot; two separate calls may straddle
/// a publish.
#[derive(Debug, Clone)]
pub struct ContentView {
    rx: watch::Receiver<Arc<VerifiedContent>>,
}

impl ContentView {
    pub fn new(rx: watch::Receiver<Arc<VerifiedContent>>) -> Self {
        Self { rx }
    }

    pub fn get(&self, campaign: &str) -> Option<Content> {
        self.rx.borrow().get(campaign).cloned()
    }

    pub fn snapshot(&self) -> Arc<VerifiedContent> {
        self.rx.borrow().clone()
    }
}

pub struct ContentSync {
    layout: StorageLayout,
    client: FetchClient,
    origin: Url,
    credentials: Option<Credentials>,
    /// Primary peer's download base, when a peer rather than the origin is
    /// the sync source.
    sideload: Option<Url>,
    campaigns: CampaignMap,
    verified: VerifiedContent,
    tokens: HashMap<String, UpdateToken>,
    published: watch::Sender<Arc<VerifiedContent>>,
    counters: Arc<Counters>,
}

impl ContentSync {
    pub fn new(
        layout: StorageLayout,
        client: FetchClient,
        origin: Url,
        credentials: Option<Credentials>,
        counters: Arc<Counters>,
    ) -> Self {
        let (published, _) = watch::channel(Arc::new(VerifiedContent::new()));
        Self {
            layout,
            client,
            origin,
            credentials,
            sideload: None,
            campaigns: CampaignMap::new(),
            verified: VerifiedContent::new(),
            tokens: HashMap::new(),
            published,
            counters,
        }
    }

    pub fn view(&self) -> ContentView {
        ContentView::new(self.published.subscribe())
    }

    #[cfg(test)]
    pub fn verified(&self, campaign: &str) -> Option<&Content> {
        self.verified.get(campaign)
    }

    pub fn token(&self, campaign: &str) -> UpdateToken {
        self.tokens.get(campaign).cloned().unwrap_or_default()
    }

    /// Base URL updates are fetched from.
    pub fn sync_endpoint(&self) -> &Url {
        self.sideload.as_ref().unwrap_or(&self.origin)
    }

    /// Peers on the local network are trusted without credentials.
    fn sync_credentials(&self) -> Option<Credentials> {
        match self.sideload {
            Some(_) => None,
            None => self.credentials.clone(),
        }
    }

    fn endpoint_for(&self, campaign: &Campaign) -> anyhow::Result<Url> {
        let mut url = self.sync_endpoint().clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("{} cannot be a base url", self.sync_endpoint()))?
            .pop_if_empty()
            .push(&campaign.id);
        Ok(url)
    }

    fn publish(&self) {
        self.published.send_replace(Arc::new(self.verified.clone()));
    }

    fn clear_token(&mut self, campaign: &Campaign) {
        self.tokens.remove(&campaign.id);
    }

    /// Start a sync for `campaign` unless one is already in flight.
    pub fn request_update(&mut self, campaign: &Campaign) -> Option<Event> {
        self.counters.increment(Counter::UpdatesTotal);
        let token = self.tokens.entry(campaign.id.clone()).or_default();
        if token.is_in_progress() {
            info!("{}: {token} in progress, ignoring update request", campaign.id);
            self.counters.increment(Counter::UpdatesIgnored);
            return None;
        }
        let existing = self.verified.get(&campaign.id).cloned();
        *token = UpdateToken::InProgress {
            prior: existing.as_ref().map(|c| c.digest.clone()),
        };
        info!("{}: requesting {token}", campaign.id);
        Some(Event::UpdateRequested {
            campaign: campaign.clone(),
            existing,
        })
    }

    /// Fan a scheduled or explicit request out to the targeted campaigns.
    pub fn request_updates(&mut self, target: Option<&str>) -> Vec<Event> {
        let targets: Vec<Campaign> = match target {
            None => self.campaigns.values().cloned().collect(),
            Some(id) => match self.campaigns.get(id) {
                Some(campaign) => vec![campaign.clone()],
                None => {
                    warn!("update requested for unknown campaign {id}");
                    Vec::new()
                }
            },
        };
        targets
            .iter()
            .filter_map(|campaign| self.request_update(campaign))
            .collect()
    }

    pub async fn on_campaigns_updated(&mut self, old: &CampaignMap, new: &CampaignMap) -> Vec<Event> {
        self.campaigns = new.clone();

        let mut forgot = false;
        for (id, campaign) in old {
            if new.contains_key(id) {
                continue;
            }
            info!("{id}: campaign removed, cleaning up");
            forgot |= self.verified.remove(id).is_some();
            self.tokens.remove(id);
            cleanup_files(&[
                self.layout.content_path(campaign),
                self.layout.metadata_path(campaign),
            ])
            .await;
        }
        if forgot {
            self.publish();
        }

        let mut events = Vec::with_capacity(new.len());
        for campaign in new.values() {
            if self.token(&campaign.id).is_in_progress() {
                debug!("{}: update in progress, skipping startup check", campaign.id);
                continue;
            }
            let event = self.startup_check(campaign).await;
            if matches!(event, Event::ContentAvailable { .. }) {
                // Verification of installed files holds the token like a fetch.
                let prior = self.verified.get(&campaign.id).map(|c| c.digest.clone());
                self.tokens
                    .insert(campaign.id.clone(), UpdateToken::InProgress { prior });
            }
            events.push(event);
        }
        events
    }

    /// Installed files on disk go straight to verification; otherwise fetch.
    async fn startup_check(&self, campaign: &Campaign) -> Event {
        let content = self.layout.content_path(campaign);
        let metadata = self.layout.metadata_path(campaign);
        if file_exists(&content).await && file_exists(&metadata).await {
            info!("{}: existing content available", campaign.id);
            Event::ContentAvailable {
                campaign: campaign.clone(),
                content,
                metadata,
            }
        } else {
            info!("{}: existing content insufficient", campaign.id);
            Event::ContentMissing(campaign.clone())
        }
    }

    pub async fn on_update_requested(&mut self, campaign: Campaign, existing: Option<Content>) -> Event {
        let endpoint = match self.endpoint_for(&campaign) {
            Ok(url) => url,
            Err(e) => return SyncFailure::new(campaign, "no sync endpoint").caused_by(e).into(),
        };
        let accept: &[&str] = match existing {
            Some(_) => &[METADATA_MEDIATYPE, DB_MEDIATYPE],
            None => &[DB_MEDIATYPE],
        };
        let request = self
            .client
            .factory(endpoint)
            .accept(accept)
            .auth(self.sync_credentials())
            .if_none_match(existing.map(|c| c.digest))
            .open()
            .await;
        let request = match request {
            Ok(request) => request,
            Err(e) => return SyncFailure::new(campaign, "update request failed").caused_by(e).into(),
        };

        match request.status() {
            StatusCode::NOT_MODIFIED => {
                info!("{}: no new content", campaign.id);
                Event::SyncUnnecessary(campaign)
            }
            StatusCode::OK => {
                let content_type = request.content_type().unwrap_or_default().to_string();
                if content_type.contains(METADATA_MEDIATYPE) {
                    self.fetch_metadata(campaign, request).await
                } else if content_type.contains(DB_MEDIATYPE) {
                    self.fetch_database(campaign, request).await
                } else {
                    SyncFailure::new(campaign, format!("unknown content {content_type}")).into()
                }
            }
            status => SyncFailure::new(campaign, format!("unexpected response: {status}")).into(),
        }
    }

    async fn fetch_metadata(&self, campaign: Campaign, request: Request) -> Event {
        info!("{}: fetching metadata", campaign.id);
        let path = match self.layout.temp_metadata() {
            Ok(path) => path,
            Err(e) => return SyncFailure::new(campaign, "metadata fetch failed").caused_by(e).into(),
        };
        let fetched = async {
            let mut file = tokio::fs::File::create(&path).await?;
            request.copy_to(&mut file, |_| {}).await?;
            anyhow::Ok(())
        };
        match fetched.await {
            Ok(()) => Event::MetadataFetched {
                campaign,
                metadata: path,
            },
            Err(e) => SyncFailure::new(campaign, "metadata fetch failed")
                .caused_by(e)
                .cleanup([path])
                .into(),
        }
    }

    /// Stream a full database to disk, capturing its metadata on the way.
    async fn fetch_database(&self, campaign: Campaign, request: Request) -> Event {
        info!("{}: fetching database", campaign.id);
        let database = match self.layout.temp_database() {
            Ok(path) => path,
            Err(e) => return SyncFailure::new(campaign, "database fetch failed").caused_by(e).into(),
        };
        let mut written = vec![database.clone()];
        let fetched = async {
            let mut capture =
                MetadataCapture::new(CAPTURE_BLOCK_SIZE, HashAlgorithm::Md5, HashAlgorithm::Md5);
            let mut file = tokio::fs::File::create(&database).await?;
            request
                .copy_to(&mut file, |chunk| capture.update(chunk))
                .await?;
            file.sync_all().await?;
            let metadata = self.layout.temp_metadata()?;
            written.push(metadata.clone());
            capture.finish().store(&metadata).await?;
            anyhow::Ok(metadata)
        };
        match fetched.await {
            Ok(metadata) => Event::DatabaseFetched {
                campaign,
                database,
                metadata,
            },
            Err(e) => SyncFailure::new(campaign, "database fetch failed")
                .caused_by(e)
                .cleanup(written)
                .into(),
        }
    }

    /// Rebuild the new database from the local one plus ranged fetches.
    pub async fn on_metadata_fetched(&mut self, campaign: Campaign, metadata_file: PathBuf) -> Event {
        self.counters.increment(Counter::MetadataFetches);
        let metadata = match Metadata::load(&metadata_file).await {
            Ok(metadata) => metadata,
            Err(e) => {
                return SyncFailure::new(campaign, "sync failed")
                    .caused_by(e)
                    .cleanup([metadata_file])
                    .into()
            }
        };
        info!("{}: incremental: {}", campaign.id, metadata.file_hash_hex());

        let database = match self.layout.temp_database() {
            Ok(path) => path,
            Err(e) => {
                return SyncFailure::new(campaign, "sync failed")
                    .caused_by(e)
                    .cleanup([metadata_file])
                    .into()
            }
        };
        let existing = self
            .verified
            .get(&campaign.id)
            .map(|c| c.content_file.clone())
            .unwrap_or_else(|| self.layout.content_path(&campaign));

        let synced = async {
            let ranges = self
                .client
                .factory(self.endpoint_for(&campaign)?)
                .accept(&[DB_MEDIATYPE])
                .auth(self.sync_credentials());
            let stats = codec::sync(&metadata, &existing, &database, &ranges).await?;
            anyhow::Ok(stats)
        };
        match synced.await {
            Ok(stats) => {
                debug!("{}: {stats:?}", campaign.id);
                Event::ContentAvailable {
                    campaign,
                    content: database,
                    metadata: metadata_file,
                }
            }
            Err(e) => SyncFailure::new(campaign, "sync failed")
                .caused_by(e)
                .cleanup([database, metadata_file])
                .into(),
        }
    }

    /// Metadata was captured during the download; nothing to rebuild.
    pub fn on_database_fetched(&mut self, campaign: Campaign, database: PathBuf, metadata: PathBuf) -> Event {
        self.counters.increment(Counter::DatabaseFetches);
        info!("{}: full download {}", campaign.id, database.display());
        Event::ContentAvailable {
            campaign,
            content: database,
            metadata,
        }
    }

    pub async fn on_content_available(
        &mut self,
        campaign: Campaign,
        content: PathBuf,
        metadata: PathBuf,
    ) -> Event {
        let checked = async {
            let declared = Metadata::load(&metadata).await?;
            let computed = hash_file(&content, declared.file_hash_alg).await?;
            Ok::<_, CodecError>((declared, computed))
        };
        let (declared, computed) = match checked.await {
            Ok(hashes) => hashes,
            // The files' state is unknown here; they are left in place.
            Err(e) => {
                return SyncFailure::new(campaign, "content verification failed")
                    .caused_by(e)
                    .into()
            }
        };

        let digest = hex::encode(&computed);
        if computed == declared.file_hash {
            info!("{}: content verified {digest}", campaign.id);
            Event::ContentVerified {
                campaign,
                content: Content::new(digest, content, metadata),
            }
        } else {
            self.counters.increment(Counter::VerifyFailures);
            warn!(
                "{}: content failed verification: expected {}, computed {digest}",
                campaign.id,
                declared.file_hash_hex()
            );
            // Installed files that no longer verify are about to be deleted.
            if self
                .verified
                .get(&campaign.id)
                .is_some_and(|c| c.content_file == content)
            {
                self.verified.remove(&campaign.id);
                self.publish();
            }
            SyncFailure::new(campaign, "content verification failed, cleaning up")
                .cleanup([content, metadata])
                .into()
        }
    }

    /// Rename the verified files onto their canonical paths.
    pub async fn on_content_verified(&mut self, campaign: Campaign, content: Content) -> Option<Event> {
        if !self.campaigns.contains_key(&campaign.id) {
            info!("{}: campaign no longer listed, discarding content", campaign.id);
            cleanup_files(&[content.content_file, content.metadata_file]).await;
            self.clear_token(&campaign);
            return None;
        }

        info!("{}: installing content {}", campaign.id, content.digest);
        let dest_content = self.layout.content_path(&campaign);
        let dest_metadata = self.layout.metadata_path(&campaign);
        let installed = async {
            tokio::fs::rename(&content.content_file, &dest_content)
                .await
                .with_context(|| {
                    format!(
                        "failed to move content: {} to {}",
                        content.content_file.display(),
                        dest_content.display()
                    )
                })?;
            tokio::fs::rename(&content.metadata_file, &dest_metadata)
                .await
                .with_context(|| {
                    format!(
                        "failed to move metadata: {} to {}",
                        content.metadata_file.display(),
                        dest_metadata.display()
                    )
                })?;
            anyhow::Ok(())
        };

        match installed.await {
            Ok(()) => Some(Event::ContentReady {
                campaign,
                content: content.relocated(&dest_content, &dest_metadata),
            }),
            Err(e) => {
                self.counters.increment(Counter::InstallFailures);
                warn!("{}: {e:#}", campaign.id);
                // The canonical files are about to be removed, so the
                // previous snapshot can no longer be served.
                if self.verified.remove(&campaign.id).is_some() {
                    self.publish();
                }
                let mut cleanup = vec![dest_content.clone(), dest_metadata.clone()];
                for source in [content.content_file, content.metadata_file] {
                    if source != dest_content && source != dest_metadata {
                        cleanup.push(source);
                    }
                }
                Some(
                    SyncFailure::new(campaign, "failure installing content, cleaning up")
                        .caused_by(e)
                        .cleanup(cleanup)
                        .into(),
                )
            }
        }
    }

    /// The only transition that changes the externally visible content.
    pub fn on_content_ready(&mut self, campaign: Campaign, content: Content) {
        info!("{}: publishing content {}", campaign.id, content.digest);
        self.verified.insert(campaign.id.clone(), content);
        self.clear_token(&campaign);
        self.publish();
    }

    pub async fn on_sync_failure(&mut self, failure: SyncFailure) {
        self.counters.increment(Counter::UpdatesFailed);
        match &failure.cause {
            Some(cause) => warn!("{}: {}: {cause:#}", failure.campaign.id, failure.message),
            None => warn!("{}: {}", failure.campaign.id, failure.message),
        }
        cleanup_files(&failure.cleanup).await;
        self.clear_token(&failure.campaign);
    }

    pub fn on_sync_unnecessary(&mut self, campaign: &Campaign) {
        self.counters.increment(Counter::UpdatesNoChange);
        self.clear_token(campaign);
    }

    pub fn on_primary_changed(&mut self, primary: &PrimaryChanged) {
        self.sideload = if primary.is_local {
            None
        } else {
            match primary.url.as_deref().map(Url::parse) {
                Some(Ok(url)) => Some(url),
                Some(Err(e)) => {
                    warn!("primary {:?} advertises a bad url: {e}", primary.name);
                    None
                }
                None => {
                    warn!("primary without urls: {:?}", primary.name);
                    None
                }
            }
        };
        info!("zeroconf change, sync endpoint: {}", self.sync_endpoint());
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Delete each path, logging (not retrying) the ones that fail.
async fn cleanup_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("nothing to remove at {}", path.display())
            }
            Err(e) => warn!("failed to delete file {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::testutil::{md5_hex, Origin};

    struct Harness {
        origin: Origin,
        dir: tempfile::TempDir,
        sync: ContentSync,
        counters: Arc<Counters>,
        trace: Vec<&'static str>,
    }

    impl Harness {
        async fn new() -> Self {
            let origin = Origin::start().await;
            let dir = tempfile::tempdir().unwrap();
            let counters = Arc::new(Counters::default());
            let client = FetchClient::new(Duration::from_secs(5), Duration::from_secs(10)).unwrap();
            let sync = ContentSync::new(
                StorageLayout::new(dir.path()),
                client,
                origin.base_url(),
                Some(Credentials {
                    username: "user".into(),
                    password: "secret".into(),
                }),
                counters.clone(),
            );
            Self {
                origin,
                dir,
                sync,
                counters,
                trace: Vec::new(),
            }
        }

        fn layout(&self) -> StorageLayout {
            StorageLayout::new(self.dir.path())
        }

        async fn list(&mut self, ids: &[&str]) {
            let new: CampaignMap = ids
                .iter()
                .map(|id| (id.to_string(), Campaign::new(*id, "")))
                .collect();
            let old = std::mem::replace(&mut self.sync.campaigns, CampaignMap::new());
            let events = self.sync.on_campaigns_updated(&old, &new).await;
            self.drain(events).await;
        }

        /// Run the content handlers until the queue is empty.
        async fn drain(&mut self, events: Vec<Event>) {
            let mut queue: VecDeque<Event> = events.into();
            while let Some(event) = queue.pop_front() {
                self.trace.push(event.name());
                let follow: Vec<Event> = match event {
                    Event::ContentMissing(c) => self.sync.request_update(&c).into_iter().collect(),
                    Event::RequestUpdate { campaign } => self.sync.request_updates(campaign.as_deref()),
                    Event::UpdateRequested { campaign, existing } => {
                        vec![self.sync.on_update_requested(campaign, existing).await]
                    }
                    Event::MetadataFetched { campaign, metadata } => {
                        vec![self.sync.on_metadata_fetched(campaign, metadata).await]
                    }
                    Event::DatabaseFetched {
                        campaign,
                        database,
                        metadata,
                    } => vec![self.sync.on_database_fetched(campaign, database, metadata)],
                    Event::ContentAvailable {
                        campaign,
                        content,
                        metadata,
                    } => vec![self.sync.on_content_available(campaign, content, metadata).await],
                    Event::ContentVerified { campaign, content } => self
                        .sync
                        .on_content_verified(campaign, content)
                        .await
                        .into_iter()
                        .collect(),
                    Event::ContentReady { campaign, content } => {
                        self.sync.on_content_ready(campaign, content);
                        Vec::new()
                    }
                    Event::SyncFailure(f) => {
                        self.sync.on_sync_failure(f).await;
                        Vec::new()
                    }
                    Event::SyncUnnecessary(c) => {
                        self.sync.on_sync_unnecessary(&c);
                        Vec::new()
                    }
                    other => panic!("unexpected event {}", other.name()),
                };
                queue.extend(follow);
            }
        }

        fn temp_files(&self) -> Vec<String> {
            std::fs::read_dir(self.dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with("metadata-") || n.starts_with("database-"))
                .collect()
        }
    }

    fn db(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn missing_content_is_downloaded_and_published() {
        let mut h = Harness::new().await;
        let data = db(5000, 1);
        h.origin.put_content("C1", data.clone());
        let view = h.sync.view();

        h.list(&["C1"]).await;

        assert_eq!(
            h.trace,
            [
                "ContentMissing",
                "UpdateRequested",
                "DatabaseFetched",
                "ContentAvailable",
                "ContentVerified",
                "ContentReady"
            ]
        );
        let c1 = Campaign::new("C1", "");
        let content = view.get("C1").unwrap();
        assert_eq!(content.digest, md5_hex(&data));
        assert_eq!(content.content_file, h.layout().content_path(&c1));
        assert_eq!(content.metadata_file, h.layout().metadata_path(&c1));
        assert_eq!(std::fs::read(&content.content_file).unwrap(), data);
        assert_eq!(h.sync.token("C1"), UpdateToken::Idle);
        assert!(h.temp_files().is_empty());

        let seen = h.origin.last_request().unwrap();
        assert_eq!(seen.accept.as_deref(), Some(DB_MEDIATYPE));
        assert!(seen.if_none_match.is_none());
        assert!(seen.authorization.is_some());
    }

    #[tokio::test]
    async fn unchanged_content_sends_digest_and_touches_nothing() {
        let mut h = Harness::new().await;
        let data = db(3000, 2);
        h.origin.put_content("C2", data.clone());
        h.list(&["C2"]).await;
        let before = h.sync.verified("C2").cloned().unwrap();
        let modified = std::fs::metadata(&before.content_file).unwrap().modified().unwrap();
        h.trace.clear();

        h.drain(vec![Event::RequestUpdate { campaign: Some("C2".into()) }])
            .await;

        assert_eq!(h.trace, ["RequestUpdate", "UpdateRequested", "SyncUnnecessary"]);
        let seen = h.origin.last_request().unwrap();
        assert_eq!(seen.if_none_match, Some(format!("\"{}\"", before.digest)));
        assert_eq!(
            seen.accept.as_deref(),
            Some("application/vnd.jrsync+jrsmd, application/x-sqlite3")
        );
        assert_eq!(h.sync.verified("C2"), Some(&before));
        assert_eq!(h.sync.token("C2"), UpdateToken::Idle);
        assert_eq!(
            std::fs::metadata(&before.content_file).unwrap().modified().unwrap(),
            modified
        );
        assert_eq!(h.counters.get(Counter::UpdatesNoChange), 1);
        assert!(h.temp_files().is_empty());
    }

    #[tokio::test]
    async fn second_request_while_in_flight_is_ignored() {
        let mut h = Harness::new().await;
        h.origin.put_content("C1", db(100, 3));
        h.sync.campaigns.insert("C1".into(), Campaign::new("C1", ""));
        let c1 = Campaign::new("C1", "");

        let first = h.sync.request_update(&c1);
        let second = h.sync.request_update(&c1);

        assert!(matches!(first, Some(Event::UpdateRequested { .. })));
        assert!(second.is_none());
        assert_eq!(h.sync.token("C1"), UpdateToken::InProgress { prior: None });
        assert_eq!(h.counters.get(Counter::UpdatesIgnored), 1);
        assert_eq!(h.counters.get(Counter::UpdatesTotal), 2);
        assert!(h.origin.requests().is_empty());

        h.drain(first.into_iter().collect()).await;
        assert_eq!(h.origin.requests().len(), 1);
        assert_eq!(h.sync.token("C1"), UpdateToken::Idle);
    }

    #[tokio::test]
    async fn incremental_update_rebuilds_from_ranges() {
        let mut h = Harness::new().await;
        let old = db(10 * 1024, 4);
        h.origin.put_content("C1", old.clone());
        h.list(&["C1"]).await;

        let mut new = old.clone();
        new[3 * 1024 + 10] ^= 0xaa;
        new.extend_from_slice(b"appended tail");
        h.origin.put_content("C1", new.clone());
        h.origin.offer_metadata(true);
        h.trace.clear();

        h.drain(vec![Event::RequestUpdate { campaign: None }]).await;

        assert_eq!(
            h.trace,
            [
                "RequestUpdate",
                "UpdateRequested",
                "MetadataFetched",
                "ContentAvailable",
                "ContentVerified",
                "ContentReady"
            ]
        );
        let content = h.sync.verified("C1").unwrap();
        assert_eq!(content.digest, md5_hex(&new));
        assert_eq!(std::fs::read(&content.content_file).unwrap(), new);
        let ranges: Vec<String> = h
            .origin
            .requests()
            .into_iter()
            .filter_map(|r| r.range)
            .collect();
        assert_eq!(ranges, ["bytes=3072-4095", "bytes=10240-10252"]);
        assert_eq!(h.counters.get(Counter::MetadataFetches), 1);
        assert!(h.temp_files().is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_deletes_fetched_files() {
        let mut h = Harness::new().await;
        let old = db(4096, 5);
        h.origin.put_content("C1", old.clone());
        h.list(&["C1"]).await;
        let before = h.sync.verified("C1").cloned().unwrap();

        let mut new = old.clone();
        new[0] ^= 1;
        h.origin.put_content("C1", new);
        h.origin.offer_metadata(true);
        h.origin.corrupt_metadata(true);
        h.trace.clear();

        h.drain(vec![Event::RequestUpdate { campaign: None }]).await;

        assert_eq!(h.trace.last(), Some(&"SyncFailure"));
        assert_eq!(h.counters.get(Counter::VerifyFailures), 1);
        assert_eq!(h.counters.get(Counter::UpdatesFailed), 1);
        assert!(h.temp_files().is_empty());
        assert_eq!(h.sync.verified("C1"), Some(&before));
        assert_eq!(std::fs::read(&before.content_file).unwrap(), old);
        assert_eq!(h.sync.token("C1"), UpdateToken::Idle);
    }

    #[tokio::test]
    async fn unknown_content_type_fails_without_files() {
        let mut h = Harness::new().await;
        h.origin.put_content("C1", db(100, 6));
        h.origin.override_content_type("text/html");

        h.list(&["C1"]).await;

        assert_eq!(h.trace, ["ContentMissing", "UpdateRequested", "SyncFailure"]);
        assert!(h.sync.verified("C1").is_none());
        assert_eq!(h.sync.token("C1"), UpdateToken::Idle);
        assert!(h.temp_files().is_empty());
    }

    #[tokio::test]
    async fn unexpected_status_is_a_failure() {
        let mut h = Harness::new().await;
        h.list(&["absent"]).await;
        assert_eq!(h.trace, ["ContentMissing", "UpdateRequested", "SyncFailure"]);
        assert_eq!(h.counters.get(Counter::UpdatesFailed), 1);
    }

    #[tokio::test]
    async fn installed_files_are_verified_at_startup() {
        let mut h = Harness::new().await;
        let data = db(2048, 7);
        let c1 = Campaign::new("C1", "");
        let meta = Metadata::generate(&data, 512, HashAlgorithm::Sha256, HashAlgorithm::Md5);
        std::fs::write(h.layout().content_path(&c1), &data).unwrap();
        std::fs::write(h.layout().metadata_path(&c1), meta.encode()).unwrap();

        h.list(&["C1"]).await;

        assert_eq!(h.trace, ["ContentAvailable", "ContentVerified", "ContentReady"]);
        assert_eq!(h.sync.verified("C1").unwrap().digest, meta.file_hash_hex());
        assert!(h.origin.requests().is_empty());
    }

    #[tokio::test]
    async fn startup_verification_blocks_concurrent_requests() {
        let mut h = Harness::new().await;
        let data = db(2048, 7);
        let c1 = Campaign::new("C1", "");
        let meta = Metadata::generate(&data, 512, HashAlgorithm::Md5, HashAlgorithm::Md5);
        std::fs::write(h.layout().content_path(&c1), &data).unwrap();
        std::fs::write(h.layout().metadata_path(&c1), meta.encode()).unwrap();
        h.origin.put_content("C1", db(2048, 8));

        let new: CampaignMap = [("C1".to_string(), c1.clone())].into();
        let startup = h.sync.on_campaigns_updated(&CampaignMap::new(), &new).await;
        assert!(matches!(startup[..], [Event::ContentAvailable { .. }]));
        assert!(h.sync.token("C1").is_in_progress());

        // A scheduled tick lands while the installed files are verifying.
        assert!(h.sync.request_update(&c1).is_none());
        assert_eq!(h.counters.get(Counter::UpdatesIgnored), 1);

        h.drain(startup).await;
        assert_eq!(h.trace, ["ContentAvailable", "ContentVerified", "ContentReady"]);
        assert_eq!(h.sync.token("C1"), UpdateToken::Idle);
        assert!(h.origin.requests().is_empty());

        let Some(Event::UpdateRequested { existing, .. }) = h.sync.request_update(&c1) else {
            panic!("expected the request to be accepted once idle");
        };
        assert_eq!(existing.unwrap().digest, meta.file_hash_hex());
        assert!(h.sync.request_update(&c1).is_none());
    }

    #[tokio::test]
    async fn verification_read_error_keeps_files_and_clears_token() {
        let mut h = Harness::new().await;
        let c1 = Campaign::new("C1", "");
        h.sync.campaigns.insert("C1".into(), c1.clone());
        h.sync
            .tokens
            .insert("C1".into(), UpdateToken::InProgress { prior: None });
        let content = h.layout().content_path(&c1);
        std::fs::write(&content, db(100, 3)).unwrap();

        let event = h
            .sync
            .on_content_available(c1.clone(), content.clone(), h.layout().metadata_path(&c1))
            .await;
        let Event::SyncFailure(failure) = event else {
            panic!("expected failure");
        };
        assert!(failure.cleanup.is_empty());
        assert!(failure.cause.is_some());
        assert_eq!(h.counters.get(Counter::VerifyFailures), 0);

        h.sync.on_sync_failure(failure).await;
        assert!(content.exists());
        assert_eq!(h.sync.token("C1"), UpdateToken::Idle);
        assert_eq!(h.counters.get(Counter::UpdatesFailed), 1);
    }

    #[tokio::test]
    async fn removed_campaign_is_forgotten_and_deleted() {
        let mut h = Harness::new().await;
        h.origin.put_content("C3", db(700, 8));
        h.origin.put_content("C4", db(800, 9));
        h.list(&["C3", "C4"]).await;
        let c3 = h.sync.verified("C3").cloned().unwrap();
        let view = h.sync.view();
        h.trace.clear();

        let old = h.sync.campaigns.clone();
        let new: CampaignMap = [("C4".to_string(), Campaign::new("C4", ""))].into();
        let events = h.sync.on_campaigns_updated(&old, &new).await;

        assert!(events.iter().all(|e| match e {
            Event::ContentAvailable { campaign, .. } => campaign.id == "C4",
            _ => false,
        }));
        assert!(view.get("C3").is_none());
        assert!(!c3.content_file.exists());
        assert!(!c3.metadata_file.exists());
        assert!(h.sync.request_updates(Some("C3")).is_empty());
    }

    #[tokio::test]
    async fn install_failure_cleans_destinations() {
        let mut h = Harness::new().await;
        let c1 = Campaign::new("C1", "");
        h.sync.campaigns.insert("C1".into(), c1.clone());
        let layout = h.layout();
        let content = Content::new(
            "00".into(),
            h.dir.path().join("database-gone.db"),
            h.dir.path().join("metadata-gone.jrsmd"),
        );
        std::fs::write(layout.metadata_path(&c1), b"stale").unwrap();

        let event = h.sync.on_content_verified(c1.clone(), content).await.unwrap();
        let Event::SyncFailure(failure) = event else {
            panic!("expected failure");
        };
        assert!(failure.cleanup.contains(&layout.content_path(&c1)));
        assert!(failure.cleanup.contains(&layout.metadata_path(&c1)));
        assert_eq!(h.counters.get(Counter::InstallFailures), 1);

        h.sync.on_sync_failure(failure).await;
        assert!(!layout.metadata_path(&c1).exists());
    }

    #[tokio::test]
    async fn peer_primary_switches_endpoint_and_drops_auth() {
        let mut h = Harness::new().await;
        let peer = Origin::start().await;
        let data = db(900, 10);
        peer.put_content("C1", data.clone());

        h.sync.on_primary_changed(&PrimaryChanged {
            is_local: false,
            name: Some("alpha".into()),
            url: Some(peer.base_url().to_string()),
        });
        h.list(&["C1"]).await;

        assert!(h.origin.requests().is_empty());
        let seen = peer.last_request().unwrap();
        assert_eq!(seen.path, "/content/C1");
        assert!(seen.authorization.is_none());
        assert_eq!(h.sync.verified("C1").unwrap().digest, md5_hex(&data));

        h.sync.on_primary_changed(&PrimaryChanged {
            is_local: true,
            name: Some("gamma".into()),
            url: None,
        });
        assert_eq!(h.sync.sync_endpoint(), &h.origin.base_url());
    }
}
