//! Data structures used throughout the sidecar.
//!
//! Campaigns arrive from the origin as JSON and are replaced wholesale on
//! every directory refresh.  Content values are only ever built from files
//! that passed hash verification, and are superseded rather than mutated.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A named, independently synchronised content stream.
///
/// Two campaigns are equal when their identifiers are equal; the display
/// name is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(alias = "uuid")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Campaign {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl PartialEq for Campaign {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Campaign {}

impl Hash for Campaign {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Campaign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}

/// Campaigns keyed by identifier.
pub type CampaignMap = BTreeMap<String, Campaign>;

/// A verified snapshot for one campaign.
///
/// `digest` is the hex-encoded hash of the content file, computed with the
/// algorithm its metadata declares.  Equality is by digest.
#[derive(Debug, Clone)]
pub struct Content {
    pub digest: String,
    pub content_file: PathBuf,
    pub metadata_file: PathBuf,
}

impl Content {
    pub fn new(digest: String, content_file: PathBuf, metadata_file: PathBuf) -> Self {
        Self {
            digest,
            content_file,
            metadata_file,
        }
    }

    /// The same snapshot relocated to new file paths.
    pub fn relocated(&self, content_file: &Path, metadata_file: &Path) -> Self {
        Self::new(
            self.digest.clone(),
            content_file.to_path_buf(),
            metadata_file.to_path_buf(),
        )
    }
}

impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Content {}

/// Per-campaign marker preventing overlapping sync attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpdateToken {
    #[default]
    Idle,
    /// An update is in flight, replacing the content with this digest, or
    /// filling a campaign that had nothing verified yet.
    InProgress { prior: Option<String> },
}

impl UpdateToken {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, UpdateToken::InProgress { .. })
    }
}

impl fmt::Display for UpdateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateToken::Idle => f.write_str("idle"),
            UpdateToken::InProgress { prior: Some(d) } => write!(f, "update of {d}"),
            UpdateToken::InProgress { prior: None } => f.write_str("update of missing content"),
        }
    }
}

/// A sidecar announced on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub name: String,
    pub port: u16,
    /// Download base URLs, one per advertised address.  May be empty.
    pub urls: Vec<String>,
}
