//! Catalog discovery by name.
//!
//! Every `*.yml` / `*.yaml` file in every directory of the catalog search
//! path may define sources. The first directory to define a name wins.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use super::source::join_pattern;
use super::{Catalog, CatalogError, CatalogFile, FileCatalog, MongoCatalog, SourceEntry, MONGO_NORMALIZED_DRIVER};
use crate::config::ResolvedConfig;
use crate::serializer::Format;

/// A source found on the search path
#[derive(Debug, Clone)]
pub struct RegisteredSource {
    pub name: String,
    /// Catalog file defining the source
    pub file: PathBuf,
    pub entry: SourceEntry,
}

/// Named catalogs found on a search path
#[derive(Debug, Clone)]
pub struct CatalogRegistry {
    search_path: Vec<PathBuf>,
}

impl CatalogRegistry {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    /// Registry over the configured search path
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.catalog_path.clone())
    }

    /// Writable directory for new catalog files (first search directory)
    pub fn user_dir(&self) -> Result<&Path> {
        self.search_path
            .first()
            .map(PathBuf::as_path)
            .context("Catalog search path is empty")
    }

    /// Every source on the search path, first definition of each name only
    pub async fn entries(&self) -> Result<Vec<RegisteredSource>> {
        let mut found: Vec<RegisteredSource> = Vec::new();

        for dir in &self.search_path {
            for file in catalog_files(dir).await? {
                let catalog = match CatalogFile::load(&file).await {
                    Ok(catalog) => catalog,
                    Err(e) => {
                        warn!(path = %file.display(), error = %e, "Skipping unreadable catalog file");
                        continue;
                    }
                };
                for (name, entry) in catalog.sources {
                    if found.iter().any(|s| s.name == name) {
                        debug!(name = %name, path = %file.display(), "Shadowed catalog source");
                        continue;
                    }
                    found.push(RegisteredSource {
                        name,
                        file: file.clone(),
                        entry,
                    });
                }
            }
        }

        Ok(found)
    }

    /// Sorted catalog names
    pub async fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.entries().await?.into_iter().map(|s| s.name).collect();
        names.sort();
        Ok(names)
    }

    pub async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.entries().await?.iter().any(|s| s.name == name))
    }

    pub async fn find(&self, name: &str) -> Result<Option<RegisteredSource>> {
        Ok(self.entries().await?.into_iter().find(|s| s.name == name))
    }

    /// Open a catalog by name.
    ///
    /// A path to an existing catalog file (such as a pack's `catalog.yml`)
    /// is also accepted; its single source is opened with relative paths
    /// resolved against the file's directory.
    pub async fn open(&self, name: &str) -> Result<Box<dyn Catalog>> {
        if let Some(source) = self.find(name).await? {
            return open_source(&source.name, &source.entry).await;
        }

        let path = Path::new(name);
        if path.is_file() {
            return open_catalog_file(path).await;
        }

        Err(CatalogError::UnknownCatalog(name.to_string()).into())
    }
}

/// Catalog files directly inside `dir`, sorted. A missing directory has none.
async fn catalog_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read catalog directory: {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Open one source definition.
pub async fn open_source(name: &str, entry: &SourceEntry) -> Result<Box<dyn Catalog>> {
    let root_map = entry.args.root_map.clone();

    if let Some(format) = Format::from_driver(&entry.driver) {
        let paths = entry.args.paths.as_ref().ok_or_else(|| CatalogError::MissingArg {
            source_name: name.to_string(),
            arg: "paths",
        })?;
        let catalog = FileCatalog::open(name, format, paths, root_map).await?;
        return Ok(Box::new(catalog));
    }

    if entry.driver == MONGO_NORMALIZED_DRIVER {
        let metadatastore = entry.args.metadatastore_db.as_deref().ok_or_else(|| CatalogError::MissingArg {
            source_name: name.to_string(),
            arg: "metadatastore_db",
        })?;
        let asset_registry = entry.args.asset_registry_db.as_deref().unwrap_or(metadatastore);
        let catalog = MongoCatalog::connect(name, metadatastore, asset_registry, root_map).await?;
        return Ok(Box::new(catalog));
    }

    Err(CatalogError::UnsupportedDriver(entry.driver.clone()).into())
}

/// Open the single source of a catalog file, resolving `relative_paths` and
/// relative root_map values against the file's directory.
async fn open_catalog_file(path: &Path) -> Result<Box<dyn Catalog>> {
    let catalog = CatalogFile::load(path).await?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut sources = catalog.sources.into_iter();
    let (name, mut entry) = match (sources.next(), sources.next()) {
        (Some(only), None) => only,
        _ => anyhow::bail!(
            "Catalog file {} must define exactly one source",
            path.display()
        ),
    };

    if let Some(relative) = entry.relative_paths() {
        let absolute = relative
            .iter()
            .map(|p| join_pattern(&base, p))
            .collect();
        entry.args.paths = Some(absolute);
    }
    for value in entry.args.root_map.values_mut() {
        if Path::new(value.as_str()).is_relative() {
            *value = base.join(value.as_str()).to_string_lossy().into_owned();
        }
    }

    open_source(&name, &entry).await
}
