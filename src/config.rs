use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::fetch::Credentials;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub http_bind: SocketAddr,
    /// Origin base for content; the campaign id is appended.
    pub download_url: Url,
    pub campaigns_url: Url,
    /// Path this node serves content under, advertised to peers.
    pub download_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub node_name: String,
    pub zeroconf: bool,
    pub advertise_ips: Vec<IpAddr>,
    pub update_initial_delay_secs: u64,
    pub update_interval_secs: u64,
    pub campaigns_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            http_bind: "0.0.0.0:8080".parse().unwrap(),
            download_url: "http://localhost:8000/api/rest/mobiledb".parse().unwrap(),
            campaigns_url: "http://localhost:8000/api/rest/campaigns".parse().unwrap(),
            download_path: "/api/rest/mobiledb".into(),
            username: None,
            password: None,
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "sidecar".into()),
            zeroconf: true,
            advertise_ips: Vec::new(),
            update_initial_delay_secs: 300,
            update_interval_secs: 1800,
            campaigns_interval_secs: 3600,
            connect_timeout_secs: 30,
            fetch_timeout_secs: 600,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("sidecar.toml"))
                .merge(Json::file("sidecar.json"))
                .merge(Env::prefixed("SIDECAR_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("SIDECAR_PASSWORD_FILE") {
            config.password = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }

        if !config.download_path.starts_with('/') {
            config.download_path.insert(0, '/');
        }

        Ok(config)
    }

    /// Basic-Auth credentials for origin requests, if a username is set.
    pub fn credentials(&self) -> Option<Credentials> {
        self.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn update_initial_delay(&self) -> Duration {
        Duration::from_secs(self.update_initial_delay_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn campaigns_interval(&self) -> Duration {
        Duration::from_secs(self.campaigns_interval_secs)
    }
}
