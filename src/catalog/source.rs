//! Catalog configuration files.
//!
//! These YAML files are what makes a catalog discoverable by name. A pack
//! directory carries one (`catalog.yml`, single source `packed_catalog`) and
//! unpack writes another into the catalog search path.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::domain::RootMap;

/// Name of the single source inside a pack's `catalog.yml`
pub const PACKED_SOURCE: &str = "packed_catalog";

/// File name of the catalog file at the root of a pack directory
pub const PACK_CATALOG_FILE: &str = "catalog.yml";

/// Top-level catalog file: named sources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceEntry>,
}

/// One named source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub driver: String,

    #[serde(default)]
    pub args: SourceArgs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SourceMetadata>,

    /// Keys this crate does not interpret, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Driver arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceArgs {
    /// Globs of document files (file drivers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,

    #[serde(default)]
    pub root_map: RootMap,

    /// MongoDB URI for Run documents (mongo driver)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadatastore_db: Option<String>,

    /// MongoDB URI for Resource/Datum documents (mongo driver)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_registry_db: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Provenance written by pack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<GeneratedBy>,

    /// `paths` relative to the pack root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_paths: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedBy {
    pub library: String,
    pub version: String,
}

impl GeneratedBy {
    /// This crate, at its build version
    pub fn current() -> Self {
        Self {
            library: "databroker_pack".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SourceEntry {
    /// Source with the given driver and no arguments
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            args: SourceArgs::default(),
            metadata: None,
            extra: BTreeMap::new(),
        }
    }

    /// `metadata.relative_paths`, if present and non-empty
    pub fn relative_paths(&self) -> Option<&[String]> {
        self.metadata
            .as_ref()
            .and_then(|m| m.relative_paths.as_deref())
            .filter(|paths| !paths.is_empty())
    }
}

impl CatalogFile {
    /// Load a catalog file from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {}", path.display()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize catalog file")
    }

    /// Catalog file holding a single source
    pub fn single(name: impl Into<String>, source: SourceEntry) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(name.into(), source);
        Self { sources }
    }
}

/// Join a relative glob such as `./documents/*.jsonl` onto `base`.
pub fn join_pattern(base: &Path, relative: &str) -> String {
    let relative = relative.trim_start_matches("./");
    base.join(relative).to_string_lossy().into_owned()
}
