//! `descriptor.json`: identity and provenance of an index directory

use crate::error::{ConfigError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Descriptor file name inside an index directory
pub const DESCRIPTOR_FILE: &str = "descriptor.json";

/// Shard format version written by this build
pub const INDEX_VERSION: &str = "docscan-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: Uuid,
    pub version: String,
    pub root: PathBuf,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl IndexDescriptor {
    /// New descriptor for a scan of `root`
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: INDEX_VERSION.to_string(),
            root: root.to_path_buf(),
            name: name.to_string(),
            timestamp: Utc::now(),
            kind: "binary".to_string(),
        }
    }

    /// Write to `<dir>/descriptor.json`
    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(DESCRIPTOR_FILE), json)?;
        Ok(())
    }

    /// Read `<dir>/descriptor.json`
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(DESCRIPTOR_FILE);
        let json = fs::read_to_string(&path).map_err(|e| ConfigError::InvalidBaseline {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Read and require a version this build can consume
    pub fn read_compatible(dir: &Path) -> Result<Self> {
        let descriptor = Self::read(dir)?;
        if descriptor.version != INDEX_VERSION {
            return Err(ConfigError::IncompatibleVersion {
                path: dir.to_path_buf(),
                found: descriptor.version,
                expected: INDEX_VERSION.to_string(),
            }
            .into());
        }
        Ok(descriptor)
    }
}
