//! The set of campaigns the origin currently publishes.

use anyhow::Context;
use log::info;
use url::Url;

use crate::events::Event;
use crate::fetch::Credentials;
use crate::types::{Campaign, CampaignMap};

pub struct CampaignDirectory {
    http: reqwest::Client,
    url: Url,
    credentials: Option<Credentials>,
    campaigns: CampaignMap,
}

impl CampaignDirectory {
    pub fn new(http: reqwest::Client, url: Url, credentials: Option<Credentials>) -> Self {
        Self {
            http,
            url,
            credentials,
            campaigns: CampaignMap::new(),
        }
    }

    #[cfg(test)]
    pub fn campaigns(&self) -> &CampaignMap {
        &self.campaigns
    }

    async fn fetch(&self) -> anyhow::Result<Vec<Campaign>> {
        let mut request = self.http.get(self.url.clone());
        if let Some(auth) = &self.credentials {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let campaigns = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch campaigns from {}", self.url))?
            .json()
            .await
            .context("malformed campaign list")?;
        Ok(campaigns)
    }

    /// Fetch the list and publish a delta when the identifiers changed.
    ///
    /// On error the held set is left exactly as it was.
    pub async fn refresh(&mut self) -> anyhow::Result<Option<Event>> {
        let campaigns = self.fetch().await?;
        Ok(self.apply(campaigns))
    }

    fn apply(&mut self, campaigns: Vec<Campaign>) -> Option<Event> {
        let new: CampaignMap = campaigns
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        if new.keys().eq(self.campaigns.keys()) {
            return None;
        }
        info!(
            "campaign update: {:?}",
            new.values().map(ToString::to_string).collect::<Vec<_>>()
        );
        let old = std::mem::replace(&mut self.campaigns, new.clone());
        Some(Event::CampaignsUpdated { old, new })
    }
}
