//! Where campaign snapshots live on disk.
//!
//! `<data_dir>/<campaign-id>.db` holds the database and
//! `<data_dir>/<campaign-id>.db.jrsmd` its metadata.  In-flight downloads are
//! temporary files in the same directory so installing them is a rename on
//! one filesystem.

use std::io;
use std::path::PathBuf;

use tempfile::Builder;

use crate::codec::METADATA_EXT;
use crate::types::Campaign;

const CONTENT_EXT: &str = "db";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    data_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn content_filename(&self, campaign: &Campaign) -> String {
        format!("{}.{CONTENT_EXT}", campaign.id)
    }

    pub fn metadata_filename(&self, campaign: &Campaign) -> String {
        format!("{}.{CONTENT_EXT}.{METADATA_EXT}", campaign.id)
    }

    pub fn content_path(&self, campaign: &Campaign) -> PathBuf {
        self.data_dir.join(self.content_filename(campaign))
    }

    pub fn metadata_path(&self, campaign: &Campaign) -> PathBuf {
        self.data_dir.join(self.metadata_filename(campaign))
    }

    /// A fresh, empty `metadata-*.jrsmd` file that survives being dropped.
    pub fn temp_metadata(&self) -> io::Result<PathBuf> {
        self.temp_file("metadata-", &format!(".{METADATA_EXT}"))
    }

    /// A fresh, empty `database-*.db` file that survives being dropped.
    pub fn temp_database(&self) -> io::Result<PathBuf> {
        self.temp_file("database-", &format!(".{CONTENT_EXT}"))
    }

    fn temp_file(&self, prefix: &str, suffix: &str) -> io::Result<PathBuf> {
        let file = Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.data_dir)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }
}
